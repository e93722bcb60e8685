//! Shared byte counter for one transfer.
//!
//! Workers add to the counter under a short std mutex; events are built
//! while locked but published after the guard is dropped, and no await point
//! is ever reached with the lock held.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

use super::constants::PROGRESS_EMIT_INTERVAL;
use crate::events::EventEmitter;

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    /// Announced size, 0 when unknown.
    pub total_size: u64,
    pub bytes_downloaded: u64,
}

impl ProgressSnapshot {
    /// Completion in whole percent; 0 while the size is unknown.
    #[must_use]
    pub fn percent(&self) -> u8 {
        percent_of(self.bytes_downloaded, self.total_size)
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_size: u64,
    downloaded: u64,
    per_worker: BTreeMap<usize, u64>,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

/// Progress of the active transfer, shared by its workers and observers.
#[derive(Debug)]
pub struct TransferProgress {
    hash: String,
    emitter: EventEmitter,
    counters: Mutex<Counters>,
}

impl TransferProgress {
    #[must_use]
    pub fn new(hash: impl Into<String>, emitter: EventEmitter) -> Self {
        Self {
            hash: hash.into(),
            emitter,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_total(&self, total_size: u64) {
        self.lock().total_size = total_size;
    }

    /// Clears all counted bytes, e.g. after a failed accelerator run whose
    /// output was discarded.
    pub fn reset(&self) {
        let mut counters = self.lock();
        counters.downloaded = 0;
        counters.per_worker.clear();
        counters.last_percent = None;
    }

    /// Counts bytes already on disk from an earlier attempt without emitting.
    pub fn seed(&self, worker: usize, bytes: u64) {
        let mut counters = self.lock();
        *counters.per_worker.entry(worker).or_default() += bytes;
        counters.downloaded += bytes;
    }

    /// Adds `bytes` written by `worker`; emits at most once per interval.
    pub fn record(&self, worker: usize, bytes: u64) {
        let due = {
            let mut counters = self.lock();
            *counters.per_worker.entry(worker).or_default() += bytes;
            counters.downloaded += bytes;
            take_due_percent(&mut counters, false)
        };
        if let Some(percent) = due {
            self.emitter.progress(&self.hash, percent);
        }
    }

    /// Sets progress from an external tool that reports percent only.
    pub fn record_percent(&self, percent: u8) {
        let due = {
            let mut counters = self.lock();
            let percent = u64::from(percent.min(100));
            counters.downloaded = counters.total_size * percent / 100;
            take_due_percent(&mut counters, false)
        };
        if let Some(percent) = due {
            self.emitter.progress(&self.hash, percent);
        }
    }

    /// Publishes the current percent regardless of the emit interval.
    pub fn flush(&self) {
        let due = take_due_percent(&mut self.lock(), true);
        if let Some(percent) = due {
            self.emitter.progress(&self.hash, percent);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let counters = self.lock();
        ProgressSnapshot {
            total_size: counters.total_size,
            bytes_downloaded: counters.downloaded,
        }
    }

    /// Bytes attributed to one worker.
    #[must_use]
    pub fn worker_bytes(&self, worker: usize) -> u64 {
        self.lock().per_worker.get(&worker).copied().unwrap_or(0)
    }
}

fn take_due_percent(counters: &mut Counters, force: bool) -> Option<u8> {
    let now = Instant::now();
    let interval_elapsed = counters
        .last_emit
        .is_none_or(|last| now.duration_since(last) >= PROGRESS_EMIT_INTERVAL);
    if !force && !interval_elapsed {
        return None;
    }
    let percent = percent_of(counters.downloaded, counters.total_size);
    if !force && counters.last_percent == Some(percent) {
        return None;
    }
    counters.last_emit = Some(now);
    counters.last_percent = Some(percent);
    Some(percent)
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (u128::from(done.min(total)) * 100 / u128::from(total)).min(100);
    u8::try_from(percent).unwrap_or(100)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn test_percent_guards_unknown_size() {
        assert_eq!(percent_of(500, 0), 0);
        assert_eq!(percent_of(50, 200), 25);
        assert_eq!(percent_of(300, 200), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_are_throttled() {
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();
        let progress = TransferProgress::new("h", emitter);
        progress.set_total(100);

        progress.record(0, 10);
        progress.record(1, 10);
        progress.record(0, 10);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Progress(10));
        assert!(rx.try_recv().is_err());

        tokio::time::advance(PROGRESS_EMIT_INTERVAL).await;
        progress.record(1, 5);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Progress(35));
        assert_eq!(progress.worker_bytes(0), 20);
        assert_eq!(progress.worker_bytes(1), 15);
    }

    #[tokio::test]
    async fn test_seed_and_reset() {
        let progress = TransferProgress::new("h", EventEmitter::default());
        progress.set_total(1000);
        progress.seed(2, 400);
        assert_eq!(progress.snapshot().percent(), 40);
        progress.reset();
        assert_eq!(progress.snapshot().bytes_downloaded, 0);
        assert_eq!(progress.snapshot().total_size, 1000);
    }

    #[tokio::test]
    async fn test_external_percent_maps_to_bytes() {
        let progress = TransferProgress::new("h", EventEmitter::default());
        progress.set_total(2000);
        progress.record_percent(50);
        assert_eq!(progress.snapshot().bytes_downloaded, 1000);
    }
}
