//! One item's trip through resolve, download, and finalize.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::DownloadQueueManager;
use super::error::{SessionError, SessionStage};
use crate::download::constants::SPEED_WINDOW;
use crate::download::{DownloadError, TransferControl, TransferProgress};
use crate::finalize::FinalizeRequest;
use crate::queue::QueueItem;

/// Speed estimate refreshed at most once per [`SPEED_WINDOW`].
#[derive(Debug)]
struct SpeedSampler {
    sampled_at: Instant,
    bytes_at: u64,
    bytes_per_sec: f64,
}

impl SpeedSampler {
    fn new(now: Instant) -> Self {
        Self {
            sampled_at: now,
            bytes_at: 0,
            bytes_per_sec: 0.0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self, bytes: u64, now: Instant) -> f64 {
        if bytes < self.bytes_at {
            // Progress was reset by a provider fallback.
            self.bytes_at = bytes;
            self.sampled_at = now;
            self.bytes_per_sec = 0.0;
            return 0.0;
        }
        let elapsed = now.saturating_duration_since(self.sampled_at);
        if elapsed >= SPEED_WINDOW {
            self.bytes_per_sec = (bytes - self.bytes_at) as f64 / elapsed.as_secs_f64();
            self.bytes_at = bytes;
            self.sampled_at = now;
        }
        self.bytes_per_sec
    }
}

#[derive(Debug)]
struct SharedState {
    stage: SessionStage,
    provider: Option<String>,
    speed: SpeedSampler,
}

/// State of the running session that status snapshots read.
#[derive(Debug)]
pub(super) struct SessionShared {
    state: Mutex<SharedState>,
}

impl SessionShared {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                stage: SessionStage::Resolving,
                provider: None,
                speed: SpeedSampler::new(Instant::now()),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn stage(&self) -> SessionStage {
        self.lock().stage
    }

    pub(super) fn provider(&self) -> Option<String> {
        self.lock().provider.clone()
    }

    pub(super) fn speed(&self, bytes: u64) -> f64 {
        self.lock().speed.sample(bytes, Instant::now())
    }

    fn enter(&self, stage: SessionStage, provider: Option<&str>) {
        let mut state = self.lock();
        state.stage = stage;
        if let Some(provider) = provider {
            state.provider = Some(provider.to_string());
        }
    }
}

/// Handles one session's inputs.
pub(super) struct SessionTask {
    pub(super) item: QueueItem,
    pub(super) generation: u64,
    pub(super) control: TransferControl,
    pub(super) progress: Arc<TransferProgress>,
    pub(super) shared: Arc<SessionShared>,
}

impl SessionTask {
    /// Runs the session to the end and reports back to the manager.
    ///
    /// Boxed because the manager spawns it from its own async methods.
    pub(super) fn run(self, manager: DownloadQueueManager) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let outcome = self.drive(&manager).await;
            manager
                .session_finished(self.generation, &self.item.content_hash, outcome)
                .await;
        })
    }

    #[instrument(skip_all, fields(hash = %self.item.content_hash, url = %self.item.content_url))]
    async fn drive(&self, manager: &DownloadQueueManager) -> Result<PathBuf, SessionError> {
        let inner = &manager.inner;
        let hash = self.item.content_hash.as_str();
        let cancel = self.control.cancellation();

        inner.emitter.status(hash, "Resolving");
        let site = tokio::select! {
            () = cancel.cancelled() => return Err(SessionError::Stopped),
            site = inner.sites.resolve(&self.item.content_url) => site?,
        };
        debug!(site = %site.name, links = site.links.len(), "content page resolved");
        let alias = if manager.adopt_site_name(self.generation, hash, &site.name).await {
            site.name.clone()
        } else {
            self.item.display_alias.clone()
        };

        let mut ignore: HashSet<String> = HashSet::new();
        let mut tried: Vec<String> = Vec::new();
        let (provider, artifact) = loop {
            let Some(candidate) = inner.registry.select_best(&site.links, &ignore) else {
                return Err(SessionError::ProvidersExhausted {
                    url: self.item.content_url.clone(),
                    tried,
                });
            };
            let key = candidate.provider_key;
            ignore.insert(key.clone());
            tried.push(key.clone());

            inner.emitter.status(hash, format!("Resolving {key}"));
            let link = tokio::select! {
                () = cancel.cancelled() => return Err(SessionError::Stopped),
                link = inner.registry.resolve_link(&key, &candidate.url) => link,
            };
            let Some(link) = link else {
                warn!(provider = %key, "provider yielded no direct link; trying next");
                continue;
            };

            self.shared.enter(SessionStage::Downloading, Some(&key));
            manager
                .record_stage(self.generation, hash, SessionStage::Downloading)
                .await;
            inner.emitter.status(hash, format!("Downloading from {key}"));
            match inner
                .downloader
                .execute(&link, hash, &self.control, &self.progress)
                .await
            {
                Ok(artifact) => break (key, artifact),
                Err(DownloadError::Stopped) => return Err(SessionError::Stopped),
                Err(e) if e.is_host_failure() => {
                    warn!(provider = %key, error = %e, "host failed before transfer; trying next");
                    self.progress.reset();
                    self.shared.enter(SessionStage::Resolving, None);
                }
                Err(e) => {
                    return Err(SessionError::Download {
                        provider: key,
                        source: e,
                    });
                }
            }
        };
        info!(provider = %provider, size = artifact.size, "download complete");

        self.shared.enter(SessionStage::Processing, None);
        manager
            .record_stage(self.generation, hash, SessionStage::Processing)
            .await;
        let request = FinalizeRequest {
            hash,
            alias: &alias,
            content_url: &self.item.content_url,
            artifact: &artifact,
        };
        tokio::select! {
            () = cancel.cancelled() => Err(SessionError::Stopped),
            placed = inner.finalizer.finalize(request) => {
                placed.map_err(|source| SessionError::Finalize { provider, source })
            }
        }
    }
}
