//! Trajectory sources
//!
//! A source is an ordered list of trajectories, each readable lazily as a
//! sequence of frame blocks. Raw trajectories are plain text, one frame per
//! line holding `x y z` for every atom in topology order.

use crate::data::Block;
use crate::store::{ArtifactKey, ArtifactStore, ArtifactStoreExt, Lookup, OutputManifest};
use crate::{PipelineError, Result};
use ndarray::Array2;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Iterator over frame blocks of one trajectory
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<Array2<f32>>> + 'a>;

pub trait TrajectorySource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable identifier of trajectory `index` (path, entry name, ...)
    fn id(&self, index: usize) -> String;

    /// Columns per frame
    fn n_coordinates(&self) -> usize;

    /// Frames of trajectory `index` in blocks of at most `chunk_size` rows
    fn chunks(&self, index: usize, chunk_size: usize) -> Result<ChunkIter<'_>>;

    /// Identity of the whole trajectory set: sorted ids and frame width
    fn fingerprint(&self) -> String {
        let mut ids: Vec<String> = (0..self.len()).map(|index| self.id(index)).collect();
        ids.sort();
        let mut hasher = Sha256::new();
        for id in &ids {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.n_coordinates().to_le_bytes());
        hex(&hasher.finalize())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Visit every block of trajectory `index`
///
/// An empty trajectory is visited once with a zero-row block, so callers
/// always see every trajectory.
pub fn for_each_chunk<S, F>(source: &S, index: usize, chunk_size: usize, mut f: F) -> Result<()>
where
    S: TrajectorySource + ?Sized,
    F: FnMut(Array2<f32>) -> Result<()>,
{
    let mut visited = false;
    for chunk in source.chunks(index, chunk_size)? {
        f(chunk?)?;
        visited = true;
    }
    if !visited {
        f(Array2::zeros((0, source.n_coordinates())))?;
    }
    Ok(())
}

/// In-memory trajectories
#[derive(Debug, Clone)]
pub struct MemorySource {
    trajectories: Vec<Array2<f32>>,
    n_coordinates: usize,
}

impl MemorySource {
    pub fn new(trajectories: Vec<Array2<f32>>) -> Result<Self> {
        let n_coordinates = trajectories.first().map(|t| t.ncols()).unwrap_or(0);
        if let Some(bad) = trajectories.iter().position(|t| t.ncols() != n_coordinates) {
            return Err(PipelineError::InvalidInput(format!(
                "trajectory {} has {} columns, expected {}",
                bad,
                trajectories[bad].ncols(),
                n_coordinates
            )));
        }
        Ok(Self {
            trajectories,
            n_coordinates,
        })
    }
}

impl TrajectorySource for MemorySource {
    fn len(&self) -> usize {
        self.trajectories.len()
    }

    fn id(&self, index: usize) -> String {
        format!("memory-{}", index)
    }

    fn n_coordinates(&self) -> usize {
        self.n_coordinates
    }

    /// In-memory ids carry no identity, so the frames themselves are hashed
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.n_coordinates.to_le_bytes());
        for trajectory in &self.trajectories {
            hasher.update(trajectory.nrows().to_le_bytes());
            for value in trajectory.iter() {
                hasher.update(value.to_le_bytes());
            }
        }
        hex(&hasher.finalize())
    }

    fn chunks(&self, index: usize, chunk_size: usize) -> Result<ChunkIter<'_>> {
        let trajectory = self.trajectories.get(index).ok_or_else(|| missing(index))?;
        let step = chunk_size.max(1);
        let n = trajectory.nrows();
        Ok(Box::new((0..n).step_by(step).map(move |start| {
            let end = (start + step).min(n);
            Ok(trajectory.slice(ndarray::s![start..end, ..]).to_owned())
        })))
    }
}

fn missing(index: usize) -> PipelineError {
    PipelineError::InvalidInput(format!("no trajectory {}", index))
}

/// Whitespace-separated text trajectories found by prefix and suffix
#[derive(Debug, Clone)]
pub struct TextTrajectorySource {
    paths: Vec<PathBuf>,
    n_coordinates: usize,
}

impl TextTrajectorySource {
    /// All files whose path starts with `prefix` and ends with `suffix`,
    /// sorted by path
    pub fn discover(prefix: &str, suffix: &str, n_coordinates: usize) -> Result<Self> {
        let (dir, name_prefix) = split_prefix(prefix);

        let mut paths = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                PipelineError::InvalidInput(format!("cannot list {}: {}", dir.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with(&name_prefix) && name.ends_with(suffix) {
                paths.push(entry.into_path());
            }
        }
        paths.sort();

        if paths.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "no trajectories match {}*{}",
                prefix, suffix
            )));
        }
        info!(count = paths.len(), prefix, suffix, "Discovered trajectories");
        Ok(Self::from_paths(paths, n_coordinates))
    }

    pub fn from_paths(paths: Vec<PathBuf>, n_coordinates: usize) -> Self {
        Self {
            paths,
            n_coordinates,
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

/// `"data/run"` → (`data`, `run`), `"data/"` → (`data`, ``), `"run"` → (`.`, `run`)
fn split_prefix(prefix: &str) -> (PathBuf, String) {
    if prefix.is_empty() {
        return (PathBuf::from("."), String::new());
    }
    if prefix.ends_with('/') || prefix.ends_with(std::path::MAIN_SEPARATOR) {
        return (PathBuf::from(prefix), String::new());
    }
    let path = Path::new(prefix);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    (dir, name)
}

impl TrajectorySource for TextTrajectorySource {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn id(&self, index: usize) -> String {
        self.paths
            .get(index)
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    fn n_coordinates(&self) -> usize {
        self.n_coordinates
    }

    /// Sorted paths with their sizes, plus the frame width
    fn fingerprint(&self) -> String {
        let mut paths: Vec<&PathBuf> = self.paths.iter().collect();
        paths.sort();
        let mut hasher = Sha256::new();
        for path in paths {
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            hasher.update(path.display().to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(size.to_le_bytes());
        }
        hasher.update(self.n_coordinates.to_le_bytes());
        hex(&hasher.finalize())
    }

    fn chunks(&self, index: usize, chunk_size: usize) -> Result<ChunkIter<'_>> {
        let path = self.paths.get(index).ok_or_else(|| missing(index))?;
        let file = File::open(path)?;
        debug!(path = %path.display(), "Reading trajectory");
        Ok(Box::new(TextChunks {
            path: path.clone(),
            lines: BufReader::new(file).lines(),
            line_number: 0,
            columns: self.n_coordinates,
            chunk_size: chunk_size.max(1),
            done: false,
        }))
    }
}

struct TextChunks {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_number: usize,
    columns: usize,
    chunk_size: usize,
    done: bool,
}

impl TextChunks {
    fn parse_line(&self, line: &str) -> Result<Vec<f32>> {
        let values = line
            .split_whitespace()
            .map(|token| token.parse::<f32>())
            .collect::<std::result::Result<Vec<f32>, _>>()
            .map_err(|e| self.bad_line(&e.to_string()))?;
        if values.len() != self.columns {
            return Err(self.bad_line(&format!(
                "{} values, expected {}",
                values.len(),
                self.columns
            )));
        }
        Ok(values)
    }

    fn bad_line(&self, reason: &str) -> PipelineError {
        PipelineError::InvalidInput(format!(
            "{}:{}: {}",
            self.path.display(),
            self.line_number,
            reason
        ))
    }

    fn next_block(&mut self) -> Result<Option<Array2<f32>>> {
        let mut values = Vec::with_capacity(self.chunk_size * self.columns);
        let mut rows = 0;
        while rows < self.chunk_size {
            let line = match self.lines.next() {
                Some(line) => line?,
                None => {
                    self.done = true;
                    break;
                }
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            values.extend(self.parse_line(&line)?);
            rows += 1;
        }
        if rows == 0 {
            return Ok(None);
        }
        Array2::from_shape_vec((rows, self.columns), values)
            .map(Some)
            .map_err(|e| self.bad_line(&e.to_string()))
    }
}

impl Iterator for TextChunks {
    type Item = Result<Array2<f32>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Previously stored Feature output, read back one trajectory at a time
pub struct StoredOutputSource<'s> {
    store: &'s dyn ArtifactStore,
    key: ArtifactKey,
    manifest: OutputManifest,
}

impl<'s> StoredOutputSource<'s> {
    /// `None` unless a committed output exists under `key`
    pub fn open(store: &'s dyn ArtifactStore, key: &ArtifactKey) -> Option<Self> {
        match store.get_output_manifest(key) {
            Lookup::Hit(manifest) => Some(Self {
                store,
                key: key.clone(),
                manifest,
            }),
            Lookup::Miss => None,
            Lookup::Corrupt(reason) => {
                debug!(key = %key, reason = %reason, "Stored output unusable as source");
                None
            }
        }
    }
}

impl TrajectorySource for StoredOutputSource<'_> {
    fn len(&self) -> usize {
        self.manifest.trajectories
    }

    fn id(&self, index: usize) -> String {
        format!("{}/{}", self.key, self.manifest.trajectory_entry(index))
    }

    fn n_coordinates(&self) -> usize {
        self.manifest.columns
    }

    fn chunks(&self, index: usize, chunk_size: usize) -> Result<ChunkIter<'_>> {
        let block = match self.store.get_trajectory(&self.key, &self.manifest, index) {
            Lookup::Hit(Block::Continuous(frames)) => frames,
            Lookup::Hit(Block::Discrete(_)) => {
                return Err(PipelineError::InvalidInput(format!(
                    "{} is discrete, expected features",
                    self.id(index)
                )))
            }
            Lookup::Miss => return Err(missing(index)),
            Lookup::Corrupt(reason) => return Err(PipelineError::Store(reason)),
        };

        let step = chunk_size.max(1);
        let n = block.nrows();
        Ok(Box::new((0..n).step_by(step).map(move |start| {
            let end = (start + step).min(n);
            Ok(block.slice(ndarray::s![start..end, ..]).to_owned())
        })))
    }
}
