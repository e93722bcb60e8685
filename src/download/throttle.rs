//! Per-worker bandwidth pacing.
//!
//! A global cap is split evenly: each of `n` workers paces itself to
//! `cap / n` bytes per second over a rolling window, sleeping off whatever
//! it moved ahead of schedule. The cap is re-read on every chunk, so a
//! change applies to a transfer already in flight.

use std::time::Duration;

use tokio::time::Instant;

use super::constants::SPEED_WINDOW;

/// Rolling-window pacer owned by a single worker.
#[derive(Debug)]
pub struct SpeedPacer {
    window_started: Instant,
    window_bytes: u64,
}

impl Default for SpeedPacer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedPacer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window_started: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Records `bytes` and returns how long to wait to stay under `quota`
    /// bytes per second.
    pub fn record(&mut self, bytes: u64, quota: Option<u64>) -> Duration {
        let now = Instant::now();
        if now.duration_since(self.window_started) >= SPEED_WINDOW {
            self.window_started = now;
            self.window_bytes = 0;
        }
        self.window_bytes = self.window_bytes.saturating_add(bytes);
        match quota {
            Some(quota) => pacing_delay(
                self.window_bytes,
                now.duration_since(self.window_started),
                quota,
            ),
            None => Duration::ZERO,
        }
    }
}

/// One worker's share of a global cap, never below 1 B/s.
#[must_use]
pub fn per_worker_quota(limit: Option<u64>, workers: usize) -> Option<u64> {
    let workers = u64::try_from(workers.max(1)).unwrap_or(u64::MAX);
    limit.filter(|l| *l > 0).map(|l| (l / workers).max(1))
}

/// Time still owed when `window_bytes` were moved in `elapsed` under `quota`.
#[must_use]
pub fn pacing_delay(window_bytes: u64, elapsed: Duration, quota: u64) -> Duration {
    if quota == 0 {
        return Duration::ZERO;
    }
    #[allow(clippy::cast_precision_loss)]
    let earliest = Duration::from_secs_f64(window_bytes as f64 / quota as f64);
    earliest.saturating_sub(elapsed)
}
