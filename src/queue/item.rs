//! Queue item types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use md5::{Digest, Md5};

/// Lifecycle of a queue item.
///
/// `queued → resolving → downloading → processing → complete`, with `error`
/// and `stopped` reachable from any of the three active states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting its turn.
    #[default]
    Queued,
    /// Site page and provider negotiation in progress.
    Resolving,
    /// Bytes are being transferred.
    Downloading,
    /// Unpacking or moving the artifact.
    Processing,
    /// Finalized; removed from the persisted queue right after.
    Complete,
    /// Failed; stays at the head until retried or removed.
    Error,
    /// Stopped by the user.
    Stopped,
}

impl QueueStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// True for states that only exist while a session is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Resolving | Self::Downloading | Self::Processing)
    }

    /// True for states that need a user action before the item runs again.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "resolving" => Ok(Self::Resolving),
            "downloading" => Ok(Self::Downloading),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// A single entry of the persisted queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Content page (or direct provider) URL as submitted.
    pub content_url: String,
    /// Name shown to the user and recorded in the library.
    pub display_alias: String,
    /// Stable id derived from `content_url`; prefixes every cache file.
    pub content_hash: String,
    /// Where the request came from (site key, `"cli"`, ...).
    pub source_tag: String,
    #[serde(default)]
    pub status: QueueStatus,
}

impl QueueItem {
    #[must_use]
    pub fn new(content_url: &str, display_alias: &str, source_tag: &str) -> Self {
        let content_url = content_url.trim();
        Self {
            content_url: content_url.to_string(),
            display_alias: display_alias.to_string(),
            content_hash: content_hash(content_url),
            source_tag: source_tag.to_string(),
            status: QueueStatus::Queued,
        }
    }
}

/// Content-addressed id for a URL: lowercase hex MD5 of the trimmed URL.
///
/// Part files, merged artifacts, and library keys are all named by it, so it
/// must match what earlier installs wrote for the same URL.
#[must_use]
pub fn content_hash(url: &str) -> String {
    hex::encode(Md5::digest(url.trim().as_bytes()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Resolving,
            QueueStatus::Downloading,
            QueueStatus::Processing,
            QueueStatus::Complete,
            QueueStatus::Error,
            QueueStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("pending".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn test_hash_is_stable_and_trimmed() {
        let a = content_hash("https://steamrip.com/celeste-free-download/");
        let b = content_hash("  https://steamrip.com/celeste-free-download/\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, content_hash("https://steamrip.com/hades-free-download/"));
    }

    #[test]
    fn test_hash_is_plain_md5_hex() {
        assert_eq!(
            content_hash("https://steamrip.com/celeste-free-download/"),
            "21b84b38606380582ff342ae9b149cca"
        );
        assert_eq!(
            content_hash("https://unknown.test/removable"),
            "86bbc55e1bff536226a27c289e729505"
        );
    }

    #[test]
    fn test_item_serializes_lowercase_status() {
        let mut item = QueueItem::new("https://x.test/a", "A", "cli");
        item.status = QueueStatus::Downloading;
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains(r#""status":"downloading""#), "{json}");
    }

    #[test]
    fn test_missing_status_defaults_to_queued() {
        let json = r#"{"content_url":"u","display_alias":"a","content_hash":"h","source_tag":"s"}"#;
        let item: QueueItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
    }

    #[test]
    fn test_state_classes() {
        assert!(QueueStatus::Downloading.is_active());
        assert!(!QueueStatus::Queued.is_active());
        assert!(QueueStatus::Error.needs_attention());
        assert!(QueueStatus::Stopped.needs_attention());
        assert!(!QueueStatus::Complete.needs_attention());
    }
}
