//! Error types for the persisted queue.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or saving the queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Reading, writing, or renaming the queue file failed.
    #[error("queue file IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The queue file exists but is not a JSON array of items.
    #[error(
        "queue file {path} is corrupt: {reason}\n  Suggestion: Move the file aside to start with an empty queue"
    )]
    Corrupt { path: PathBuf, reason: String },

    /// Encoding the queue failed; nothing was written.
    #[error("could not encode queue: {0}")]
    Serialize(String),

    /// Another process holds the queue lock.
    #[error(
        "queue {path} is in use by another process\n  Suggestion: Close the other vaultdl instance or remove a stale {path}.lock"
    )]
    Locked { path: PathBuf },

    /// No queue item has this hash.
    #[error("queue item not found: {0}\n  Suggestion: Run with --list to see queued hashes")]
    ItemNotFound(String),
}

impl QueueError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn item_not_found(hash: &str) -> Self {
        Self::ItemNotFound(hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_not_found_message() {
        let msg = QueueError::item_not_found("abc123").to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("abc123"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_corrupt_names_path() {
        let msg = QueueError::corrupt("/state/downloads.json", "expected array").to_string();
        assert!(msg.contains("/state/downloads.json"));
        assert!(msg.contains("expected array"));
    }
}
