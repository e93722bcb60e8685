//! Fire-and-forget notifications for observers of the download pipeline.
//!
//! Events are published on a broadcast channel. Publishing never blocks and
//! never fails: with no subscriber attached the event is simply dropped, and a
//! slow subscriber observes `RecvError::Lagged` rather than stalling workers.

use std::path::PathBuf;

use tokio::sync::broadcast;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Payload of a single notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Human-readable state change ("Resolving buzzheavier", "Paused", ...).
    Status(String),
    /// Overall completion, 0-100.
    Progress(u8),
    /// Size and artifact name, published once the probe succeeds.
    Meta {
        /// Total size in bytes, 0 when unknown.
        total_size: u64,
        /// Name of the cache artifact being produced.
        filename: String,
    },
    /// Terminal failure for the item, naming the stage and provider.
    Error(String),
    /// Item finalized at `path`.
    Complete {
        /// Final location in the library directory.
        path: PathBuf,
    },
}

/// A notification tied to one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEvent {
    /// Content hash of the queue item.
    pub hash: String,
    /// What happened.
    pub kind: EventKind,
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<DownloadEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventEmitter {
    /// Creates an emitter whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns a new receiver that observes events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    /// Publishes `kind` for `hash`.
    pub fn emit(&self, hash: &str, kind: EventKind) {
        // No receivers is not an error for a notification channel.
        let _ = self.sender.send(DownloadEvent {
            hash: hash.to_string(),
            kind,
        });
    }

    pub fn status(&self, hash: &str, text: impl Into<String>) {
        self.emit(hash, EventKind::Status(text.into()));
    }

    pub fn progress(&self, hash: &str, percent: u8) {
        self.emit(hash, EventKind::Progress(percent.min(100)));
    }

    pub fn error(&self, hash: &str, message: impl Into<String>) {
        self.emit(hash, EventKind::Error(message.into()));
    }
}
