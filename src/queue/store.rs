//! JSON-file persistence for the ordered queue.
//!
//! The whole list is rewritten after every mutation through a temp file in
//! the same directory followed by a rename, so a crash leaves either the old
//! or the new list on disk, never a truncated one. An advisory exclusive
//! lock on `{file}.lock` keeps a second process from writing the same queue.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use super::error::QueueError;
use super::item::QueueItem;

/// Single writer over the queue file.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    // Held for the store's lifetime; dropping it releases the lock.
    _lock: File,
}

impl QueueStore {
    /// Opens the store, creating the parent directory and taking the lock.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Locked`] when another process holds the lock
    /// and [`QueueError::Io`] when the lock file cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::io(parent, e))?;
        }
        let lock_path = lock_path(&path);
        let lock = File::create(&lock_path).map_err(|e| QueueError::io(&lock_path, e))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(QueueError::Locked { path });
        }
        Ok(Self { path, _lock: lock })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted list; a missing or empty file is an empty queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Corrupt`] when the file is not a JSON array of
    /// items.
    pub fn load(&self) -> Result<Vec<QueueItem>, QueueError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::io(&self.path, e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|e| QueueError::corrupt(&self.path, e.to_string()))
    }

    /// Atomically replaces the persisted list.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] when the temp file cannot be written or
    /// renamed into place.
    pub fn save(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        write_json_atomic(&self.path, &items).map_err(|e| match e {
            AtomicWriteError::Encode(e) => QueueError::Serialize(e.to_string()),
            AtomicWriteError::Io(e) => QueueError::io(&self.path, e),
        })?;
        debug!(path = %self.path.display(), items = items.len(), "queue saved");
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Failure of [`write_json_atomic`].
#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("write failed: {0}")]
    Io(#[source] std::io::Error),
}

/// Pretty-prints `value` to a temp file next to `path`, syncs, and renames
/// it over `path`.
///
/// # Errors
///
/// Returns [`AtomicWriteError`] when encoding, writing, or the rename fails.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), AtomicWriteError> {
    let json = serde_json::to_vec_pretty(value).map_err(AtomicWriteError::Encode)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(AtomicWriteError::Io)?;
    tmp.write_all(&json).map_err(AtomicWriteError::Io)?;
    tmp.as_file().sync_all().map_err(AtomicWriteError::Io)?;
    tmp.persist(path).map_err(|e| AtomicWriteError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;

    #[test]
    fn test_missing_file_is_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("state/downloads.json")).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_preserves_order_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(dir.path().join("downloads.json")).unwrap();
        let mut second = QueueItem::new("https://x.test/b", "B", "cli");
        second.status = QueueStatus::Error;
        let items = vec![QueueItem::new("https://x.test/a", "A", "cli"), second];
        store.save(&items).unwrap();
        assert_eq!(store.load().unwrap(), items);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloads.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = QueueStore::open(&path).unwrap();
        assert!(matches!(store.load(), Err(QueueError::Corrupt { .. })));
    }

    #[test]
    fn test_second_store_on_same_file_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloads.json");
        let _first = QueueStore::open(&path).unwrap();
        assert!(matches!(QueueStore::open(&path), Err(QueueError::Locked { .. })));
    }

    #[test]
    fn test_atomic_write_error_keeps_source() {
        use std::error::Error as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing/library.json");
        let err = write_json_atomic(&path, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, AtomicWriteError::Io(_)));
        assert!(err.to_string().starts_with("write failed:"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["a"], 2);
    }
}
