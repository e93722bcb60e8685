//! Manager and per-session error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::download::DownloadError;
use crate::finalize::FinalizeError;
use crate::queue::QueueError;
use crate::site::SiteError;

/// Pipeline stage an item was in when its session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Resolving,
    Downloading,
    Processing,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolving => "resolve",
            Self::Downloading => "download",
            Self::Processing => "finalize",
        })
    }
}

/// Why one item's session ended without completing.
///
/// Every message names the stage, and the provider once one was chosen.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("[resolve] {0}")]
    Site(#[from] SiteError),

    #[error(
        "[resolve] no provider could serve {url} (tried: {tried})\n  Suggestion: Disable dead providers in the config or retry later",
        tried = display_tried(.tried)
    )]
    ProvidersExhausted { url: String, tried: Vec<String> },

    #[error("[download via {provider}] {source}")]
    Download {
        provider: String,
        #[source]
        source: DownloadError,
    },

    #[error("[finalize after {provider}] {source}")]
    Finalize {
        provider: String,
        #[source]
        source: FinalizeError,
    },

    #[error("session stopped")]
    Stopped,
}

fn display_tried(tried: &[String]) -> String {
    if tried.is_empty() {
        "none".to_string()
    } else {
        tried.join(", ")
    }
}

impl SessionError {
    #[must_use]
    pub fn stage(&self) -> Option<SessionStage> {
        match self {
            Self::Site(_) | Self::ProvidersExhausted { .. } => Some(SessionStage::Resolving),
            Self::Download { .. } => Some(SessionStage::Downloading),
            Self::Finalize { .. } => Some(SessionStage::Processing),
            Self::Stopped => None,
        }
    }

    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Download { provider, .. } | Self::Finalize { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

/// Errors surfaced by [`super::DownloadQueueManager`] operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("cache operation failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a download is active\n  Suggestion: Stop it before wiping the cache")]
    Busy,
}

impl ManagerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
