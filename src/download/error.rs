//! Error types for the download module.
//!
//! Variants carry the URL or path they concern so a failure can be reported
//! without the caller re-attaching context.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during segmented downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout { url: String },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus { url: String, status: u16 },

    /// A ranged request was answered with the full body.
    #[error("server ignored byte range {range} for {url}")]
    RangeIgnored { url: String, range: String },

    /// File system error (create part, write, rename, etc.)
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// One worker failed; part files are kept for a later resume.
    #[error("segment {index} failed: {source}")]
    SegmentFailed {
        index: usize,
        #[source]
        source: Box<DownloadError>,
    },

    /// Concatenating part files failed; not retried automatically.
    #[error("merging parts into {path} failed: {source}")]
    MergeFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Byte count on disk disagrees with what the server announced.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// The external accelerator exited unsuccessfully.
    #[error("accelerator {program} failed: {detail}")]
    Accelerator { program: String, detail: String },

    /// The transfer was stopped by its controller.
    #[error("download stopped")]
    Stopped,
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Maps a reqwest failure, promoting timeouts.
    pub fn from_request(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, source)
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn segment(index: usize, source: DownloadError) -> Self {
        Self::SegmentFailed {
            index,
            source: Box::new(source),
        }
    }

    pub fn merge(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::MergeFailed {
            path: path.into(),
            source,
        }
    }

    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// True when the host, not local state, is at fault and a different
    /// provider may succeed.
    #[must_use]
    pub fn is_host_failure(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Timeout { .. }
                | Self::HttpStatus { .. }
                | Self::RangeIgnored { .. }
                | Self::InvalidUrl { .. }
        )
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}
