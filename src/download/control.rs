//! Pause, stop, and speed-limit signals shared between a controller and the
//! workers of one transfer.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::DownloadError;

/// Cloneable handle over the signals of one transfer.
///
/// Stop is sticky; pause and the speed limit can change at any time and are
/// observed by workers between chunks.
#[derive(Debug, Clone)]
pub struct TransferControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    speed_limit: Arc<watch::Sender<Option<u64>>>,
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TransferControl {
    /// Creates a running control with an optional limit in bytes per second.
    #[must_use]
    pub fn new(speed_limit: Option<u64>) -> Self {
        let (paused, _) = watch::channel(false);
        let (limit, _) = watch::channel(speed_limit.filter(|bytes| *bytes > 0));
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
            speed_limit: Arc::new(limit),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Stops the transfer; paused workers are released so they can exit.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.paused.send_replace(false);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Sets the aggregate limit; `None` or `Some(0)` removes it.
    pub fn set_speed_limit(&self, bytes_per_sec: Option<u64>) {
        self.speed_limit
            .send_replace(bytes_per_sec.filter(|bytes| *bytes > 0));
    }

    #[must_use]
    pub fn speed_limit(&self) -> Option<u64> {
        *self.speed_limit.borrow()
    }

    /// Resolves on the next [`Self::set_speed_limit`] call after this one
    /// was polled, so a pacing sleep can be cut short.
    pub async fn speed_limit_changed(&self) {
        let mut rx = self.speed_limit.subscribe();
        // The sender lives in `self`, so this only ends on a change.
        let _ = rx.changed().await;
    }

    /// Token cancelled on stop; child tokens let a transfer abort its own
    /// workers without stopping the session.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Suspends while paused.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Stopped`] if the transfer is stopped before or
    /// during the pause.
    pub async fn wait_while_paused(&self) -> Result<(), DownloadError> {
        if self.is_stopped() {
            return Err(DownloadError::Stopped);
        }
        let mut rx = self.paused.subscribe();
        tokio::select! {
            () = self.cancel.cancelled() => Err(DownloadError::Stopped),
            changed = rx.wait_for(|paused| !*paused) => match changed {
                Ok(_) if !self.is_stopped() => Ok(()),
                _ => Err(DownloadError::Stopped),
            },
        }
    }
}
