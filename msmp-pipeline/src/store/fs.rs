//! Directory-backed artifact store

use super::{ArtifactKey, ArtifactStore};
use msmp_common::fsutil::atomic_write;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One sub-directory per key, one file per entry
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn entry_path(&self, key: &ArtifactKey, entry: &str) -> PathBuf {
        self.key_dir(key).join(entry)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn read_entry(&self, key: &ArtifactKey, entry: &str) -> msmp_common::Result<Option<Vec<u8>>> {
        let path = self.entry_path(key, entry);
        match fs::read(&path) {
            Ok(bytes) => {
                debug!(path = %path.display(), bytes = bytes.len(), "Read artifact entry");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_entry(&self, key: &ArtifactKey, entry: &str, bytes: &[u8]) -> msmp_common::Result<()> {
        let path = self.entry_path(key, entry);
        atomic_write(&path, bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "Wrote artifact entry");
        Ok(())
    }

    fn remove_entry(&self, key: &ArtifactKey, entry: &str) -> msmp_common::Result<()> {
        match fs::remove_file(self.entry_path(key, entry)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_entries(&self, key: &ArtifactKey) -> msmp_common::Result<Vec<String>> {
        let dir = match fs::read_dir(self.key_dir(key)) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in dir {
            let name = entry?.file_name().to_string_lossy().to_string();
            // In-flight temp files are hidden
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path());
        let key = ArtifactKey::new("0-feature-abc");

        assert_eq!(store.read_entry(&key, "model.json").unwrap(), None);
        store.write_entry(&key, "model.json", b"{}").unwrap();
        assert_eq!(
            store.read_entry(&key, "model.json").unwrap(),
            Some(b"{}".to_vec())
        );
        assert!(store.entry_path(&key, "model.json").exists());

        store.remove_entry(&key, "model.json").unwrap();
        store.remove_entry(&key, "model.json").unwrap();
        assert_eq!(store.read_entry(&key, "model.json").unwrap(), None);
    }

    #[test]
    fn test_list_skips_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path());
        let key = ArtifactKey::new("2-clustering-abc");

        assert!(store.list_entries(&key).unwrap().is_empty());
        store.write_entry(&key, "output.json", b"{}").unwrap();
        fs::write(store.key_dir(&key).join(".output.json.tmp.1.0"), b"{").unwrap();

        assert_eq!(store.list_entries(&key).unwrap(), vec!["output.json".to_string()]);
    }
}
