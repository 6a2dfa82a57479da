//! In-memory artifact store with access counters

use super::{ArtifactKey, ArtifactStore};
use msmp_common::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

type Entries = HashMap<(ArtifactKey, String), Vec<u8>>;

/// Process-local store; each entry replacement happens under one write lock
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<Entries>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read_entry` calls so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_entry` calls so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> Error {
    Error::Internal("artifact store lock poisoned".to_string())
}

impl ArtifactStore for MemoryArtifactStore {
    fn read_entry(&self, key: &ArtifactKey, entry: &str) -> msmp_common::Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(&(key.clone(), entry.to_string())).cloned())
    }

    fn write_entry(&self, key: &ArtifactKey, entry: &str, bytes: &[u8]) -> msmp_common::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert((key.clone(), entry.to_string()), bytes.to_vec());
        Ok(())
    }

    fn remove_entry(&self, key: &ArtifactKey, entry: &str) -> msmp_common::Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(&(key.clone(), entry.to_string()));
        Ok(())
    }

    fn list_entries(&self, key: &ArtifactKey) -> msmp_common::Result<Vec<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut names: Vec<String> = entries
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
