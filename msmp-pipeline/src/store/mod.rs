//! Artifact persistence
//!
//! Every stage key owns a small set of named entries:
//!
//! - `model.json`: the fitted [`Model`]
//! - `stat-<name>.json`: auxiliary statistics (e.g. `stat-cumvar.json`)
//! - `output.json`: manifest of the committed Output generation
//! - `traj-<generation>-<index>.bin`: one bincode [`Block`] per trajectory
//!
//! Backends only move bytes ([`ArtifactStore`]); typed access and the commit
//! protocol for multi-entry outputs live in [`ArtifactStoreExt`].
//!
//! The manifest is the commit point of a whole stage: it records the digest
//! of the model and statistic entries the output was produced with, so an
//! output whose model was replaced without a matching commit is detectable.
//!
//! Lookups never fail: a missing entry is [`Lookup::Miss`] and an entry that
//! cannot be read or decoded is [`Lookup::Corrupt`]. Both mean "this tier is
//! unavailable" to the resolver.

mod fs;
mod memory;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;

use crate::data::{Block, Output};
use crate::model::Model;
use crate::{PipelineError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MODEL_ENTRY: &str = "model.json";
pub const OUTPUT_MANIFEST_ENTRY: &str = "output.json";

/// Deterministic identifier of one stage's artifacts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of reading one artifact
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    /// Present but unreadable; carries the reason for logging
    Corrupt(String),
}

impl<T> Lookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Hit(value) => Lookup::Hit(f(value)),
            Lookup::Miss => Lookup::Miss,
            Lookup::Corrupt(reason) => Lookup::Corrupt(reason),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> Lookup<U>) -> Lookup<U> {
        match self {
            Lookup::Hit(value) => f(value),
            Lookup::Miss => Lookup::Miss,
            Lookup::Corrupt(reason) => Lookup::Corrupt(reason),
        }
    }
}

/// Which artifact of a key to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Model,
    Output,
}

/// The durable result of a stage
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Model(Model),
    Output(Output),
}

/// Commit record of a stored Output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputManifest {
    /// Generation whose trajectory entries make up this Output
    pub generation: Uuid,
    pub trajectories: usize,
    /// Frames per trajectory
    pub frames: Vec<usize>,
    /// Stored width (1 for discrete outputs)
    pub columns: usize,
    /// Unix timestamp of the commit
    pub written_at: i64,
    /// Digest of the model and statistic entries committed with this output
    #[serde(default)]
    pub model_digest: Option<String>,
}

impl OutputManifest {
    pub fn trajectory_entry(&self, index: usize) -> String {
        trajectory_entry(&self.generation, index)
    }
}

fn trajectory_entry(generation: &Uuid, index: usize) -> String {
    format!("traj-{}-{:05}.bin", generation.simple(), index)
}

pub fn statistic_entry(name: &str) -> String {
    format!("stat-{}.json", name)
}

/// Byte-level artifact backend
///
/// Writes must be atomic and durable before returning: a reader sees either
/// the previous entry or the new one.
pub trait ArtifactStore: Send + Sync {
    /// `Ok(None)` if the entry does not exist
    fn read_entry(&self, key: &ArtifactKey, entry: &str) -> msmp_common::Result<Option<Vec<u8>>>;

    fn write_entry(&self, key: &ArtifactKey, entry: &str, bytes: &[u8]) -> msmp_common::Result<()>;

    /// Removing an absent entry is not an error
    fn remove_entry(&self, key: &ArtifactKey, entry: &str) -> msmp_common::Result<()>;

    /// Names of all committed entries under `key`
    fn list_entries(&self, key: &ArtifactKey) -> msmp_common::Result<Vec<String>>;
}

/// Typed access on top of any [`ArtifactStore`]
pub trait ArtifactStoreExt: ArtifactStore {
    fn get_model(&self, key: &ArtifactKey) -> Lookup<Model> {
        read_json(self, key, MODEL_ENTRY)
    }

    fn put_model(&self, key: &ArtifactKey, model: &Model) -> Result<()> {
        write_json(self, key, MODEL_ENTRY, model)
    }

    fn get_statistic(&self, key: &ArtifactKey, name: &str) -> Lookup<Vec<f64>> {
        read_json(self, key, &statistic_entry(name))
    }

    fn put_statistic(&self, key: &ArtifactKey, name: &str, values: &[f64]) -> Result<()> {
        write_json(self, key, &statistic_entry(name), &values)
    }

    fn get_output_manifest(&self, key: &ArtifactKey) -> Lookup<OutputManifest> {
        read_json::<OutputManifest, _>(self, key, OUTPUT_MANIFEST_ENTRY).and_then(|manifest| {
            if manifest.frames.len() == manifest.trajectories {
                Lookup::Hit(manifest)
            } else {
                Lookup::Corrupt(format!(
                    "manifest lists {} trajectories but {} frame counts",
                    manifest.trajectories,
                    manifest.frames.len()
                ))
            }
        })
    }

    /// One trajectory of a committed Output, checked against its manifest
    fn get_trajectory(&self, key: &ArtifactKey, manifest: &OutputManifest, index: usize) -> Lookup<Block> {
        let entry = manifest.trajectory_entry(index);
        let expected = match manifest.frames.get(index) {
            Some(&frames) => frames,
            None => return Lookup::Miss,
        };

        read_raw(self, key, &entry).and_then(|bytes| match bincode::deserialize::<Block>(&bytes) {
            Ok(block) if block.n_frames() != expected => Lookup::Corrupt(format!(
                "{} holds {} frames, manifest says {}",
                entry,
                block.n_frames(),
                expected
            )),
            Ok(block) => Lookup::Hit(block),
            Err(e) => Lookup::Corrupt(format!("{}: {}", entry, e)),
        })
    }

    fn get_output(&self, key: &ArtifactKey) -> Lookup<Output> {
        self.get_output_manifest(key)
            .and_then(|manifest| self.read_output(key, &manifest))
    }

    /// Every trajectory listed by an already loaded manifest
    fn read_output(&self, key: &ArtifactKey, manifest: &OutputManifest) -> Lookup<Output> {
        let mut blocks = Vec::with_capacity(manifest.trajectories);
        for index in 0..manifest.trajectories {
            match self.get_trajectory(key, manifest, index) {
                Lookup::Hit(block) => blocks.push(block),
                // The manifest is only written after every trajectory, so a
                // missing trajectory means the entry set is damaged
                Lookup::Miss => {
                    return Lookup::Corrupt(format!(
                        "missing {}",
                        manifest.trajectory_entry(index)
                    ))
                }
                Lookup::Corrupt(reason) => return Lookup::Corrupt(reason),
            }
        }
        Lookup::Hit(Output::new(blocks))
    }

    /// Digest over the stored model entry and the named statistic entries
    ///
    /// Misses if any of them is absent.
    fn model_digest(&self, key: &ArtifactKey, statistics: &[&str]) -> Lookup<String> {
        let mut entries = vec![MODEL_ENTRY.to_string()];
        entries.extend(statistics.iter().map(|name| statistic_entry(name)));

        let mut hasher = Sha256::new();
        for entry in &entries {
            match read_raw(self, key, entry) {
                Lookup::Hit(bytes) => {
                    hasher.update(entry.as_bytes());
                    hasher.update((bytes.len() as u64).to_le_bytes());
                    hasher.update(&bytes);
                }
                Lookup::Miss => return Lookup::Miss,
                Lookup::Corrupt(reason) => return Lookup::Corrupt(reason),
            }
        }
        Lookup::Hit(hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Persist `output` as a new generation and commit it
    ///
    /// Trajectory entries are written first, then the manifest replaces the
    /// previous one in a single atomic write. Entries of older generations are
    /// removed only after the commit.
    fn put_output(&self, key: &ArtifactKey, output: &Output) -> Result<()> {
        self.commit_output(key, output, None)
    }

    /// [`put_output`](ArtifactStoreExt::put_output), binding the commit to
    /// the model entries identified by `model_digest`
    fn commit_output(&self, key: &ArtifactKey, output: &Output, model_digest: Option<String>) -> Result<()> {
        let generation = Uuid::new_v4();
        for (index, block) in output.trajectories().iter().enumerate() {
            let bytes = bincode::serialize(block)
                .map_err(|e| PipelineError::Store(format!("encoding trajectory {}: {}", index, e)))?;
            self.write_entry(key, &trajectory_entry(&generation, index), &bytes)
                .map_err(store_error)?;
        }

        let manifest = OutputManifest {
            generation,
            trajectories: output.len(),
            frames: output.trajectories().iter().map(Block::n_frames).collect(),
            columns: output.n_columns(),
            written_at: chrono::Utc::now().timestamp(),
            model_digest,
        };
        write_json(self, key, OUTPUT_MANIFEST_ENTRY, &manifest)?;
        debug!(key = %key, generation = %generation, trajectories = output.len(), "Committed output");

        let current = format!("traj-{}-", generation.simple());
        let stale: Vec<String> = self
            .list_entries(key)
            .map_err(store_error)?
            .into_iter()
            .filter(|name| name.starts_with("traj-") && !name.starts_with(&current))
            .collect();
        for name in stale {
            if let Err(e) = self.remove_entry(key, &name) {
                warn!(key = %key, entry = %name, error = %e, "Failed to remove superseded entry");
            }
        }
        Ok(())
    }

    fn put(&self, key: &ArtifactKey, artifact: &Artifact) -> Result<()> {
        match artifact {
            Artifact::Model(model) => self.put_model(key, model),
            Artifact::Output(output) => self.put_output(key, output),
        }
    }

    fn get(&self, key: &ArtifactKey, slot: Slot) -> Lookup<Artifact> {
        match slot {
            Slot::Model => self.get_model(key).map(Artifact::Model),
            Slot::Output => self.get_output(key).map(Artifact::Output),
        }
    }
}

impl<S: ArtifactStore + ?Sized> ArtifactStoreExt for S {}

fn store_error(e: msmp_common::Error) -> PipelineError {
    PipelineError::Store(e.to_string())
}

fn read_raw<S: ArtifactStore + ?Sized>(store: &S, key: &ArtifactKey, entry: &str) -> Lookup<Vec<u8>> {
    match store.read_entry(key, entry) {
        Ok(Some(bytes)) => Lookup::Hit(bytes),
        Ok(None) => Lookup::Miss,
        Err(e) => Lookup::Corrupt(format!("{}: {}", entry, e)),
    }
}

fn read_json<T: DeserializeOwned, S: ArtifactStore + ?Sized>(
    store: &S,
    key: &ArtifactKey,
    entry: &str,
) -> Lookup<T> {
    read_raw(store, key, entry).and_then(|bytes| match serde_json::from_slice(&bytes) {
        Ok(value) => Lookup::Hit(value),
        Err(e) => Lookup::Corrupt(format!("{}: {}", entry, e)),
    })
}

fn write_json<T: Serialize + ?Sized, S: ArtifactStore + ?Sized>(
    store: &S,
    key: &ArtifactKey,
    entry: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| PipelineError::Store(format!("encoding {}: {}", entry, e)))?;
    store.write_entry(key, entry, &bytes).map_err(store_error)
}
