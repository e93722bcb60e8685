//! Constants for the download module (timeouts, durability, pacing).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Part files are fsynced after this many bytes.
pub const SYNC_INTERVAL_BYTES: u64 = 1024 * 1024;

/// Minimum spacing between progress events for one transfer.
pub const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(250);

/// Rolling window for per-worker pacing and speed sampling.
pub const SPEED_WINDOW: Duration = Duration::from_secs(1);

/// Floor on connections when delegating to an external accelerator.
pub const ACCELERATOR_MIN_CONNECTIONS: usize = 4;

/// Upper bound on parallel segments regardless of provider advice.
pub const MAX_WORKERS: usize = 64;
