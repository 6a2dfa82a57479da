//! Atomic file replacement
//!
//! Every durable write in msmp goes through [`atomic_write`]: the payload is
//! written to a sibling temp file, flushed to disk, then renamed over the
//! target. Readers see either the previous content or the new content, never
//! a partially written file.

use crate::{Error, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp file path used while replacing `target`
///
/// Unique per process and per call so that concurrent writers to the same
/// target never share a temp file (last rename wins).
fn temp_path_for(target: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = target
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "entry".to_string());
    target.with_file_name(format!(".{}.tmp.{}.{}", file_name, std::process::id(), n))
}

/// Atomically replace `target` with `bytes`
///
/// Durable before return: the temp file is fsynced before the rename, and on
/// Unix the parent directory is fsynced after it.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path_for(target);
    let write_result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Io(e));
    }

    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Io(e));
    }

    sync_parent_dir(target);
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::Internal(format!("JSON serialization failed: {}", e)))?;
    atomic_write(target, &json)
}

#[cfg(unix)]
fn sync_parent_dir(target: &Path) {
    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            // Best-effort: some filesystems refuse fsync on directories
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_target: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parent_and_file() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("nested").join("entry.bin");

        atomic_write(&target, b"payload").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("entry.bin");

        atomic_write(&target, b"first").unwrap();
        atomic_write(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let target = Path::new("/tmp/x/model.json");
        assert_ne!(temp_path_for(target), temp_path_for(target));
    }
}
