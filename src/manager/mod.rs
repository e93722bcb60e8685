//! Single-flight coordinator over the persisted queue.
//!
//! # Overview
//!
//! [`DownloadQueueManager`] owns the queue list and at most one running
//! session. The head of the queue is the only item that may leave
//! `queued`; everything else waits. A session resolves the content page,
//! walks providers by priority, downloads through
//! [`SegmentedDownloader`], and finalizes into the library. The item is
//! removed from the queue only after finalize succeeds.
//!
//! Operations that preempt the running session (stop, reorder with a new
//! head, remove of the active item) cancel it and wait for its task to
//! exit before anything else starts, so two sessions never overlap.

mod error;
mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

pub use error::{ManagerError, SessionError, SessionStage};
use session::{SessionShared, SessionTask};

use crate::download::{SegmentedDownloader, TransferControl, TransferProgress};
use crate::events::{EventEmitter, EventKind};
use crate::finalize::Finalizer;
use crate::provider::ProviderRegistry;
use crate::queue::{QueueError, QueueItem, QueueStatus, QueueStore, apply_order, content_hash};
use crate::site::{SiteResolver, name_from_url};

/// Collaborators the manager is built from.
pub struct ManagerParts {
    pub store: QueueStore,
    pub sites: SiteResolver,
    pub registry: Arc<ProviderRegistry>,
    pub downloader: SegmentedDownloader,
    pub finalizer: Finalizer,
    pub emitter: EventEmitter,
    /// Global cap in bytes per second, `None` for unlimited.
    pub speed_limit: Option<u64>,
}

/// Result of [`DownloadQueueManager::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Added(String),
    AlreadyQueued(String),
}

impl EnqueueResult {
    #[must_use]
    pub fn hash(&self) -> &str {
        match self {
            Self::Added(hash) | Self::AlreadyQueued(hash) => hash,
        }
    }
}

/// Live view of the running session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub content_url: String,
    pub alias: String,
    pub hash: String,
    pub status: QueueStatus,
    pub provider: Option<String>,
    pub target_dir: PathBuf,
    /// 0 until the probe reports a size.
    pub total_size: u64,
    pub bytes_downloaded: u64,
    pub bytes_per_sec: f64,
    /// `None` while speed or size is unknown.
    pub remaining: Option<Duration>,
    pub progress_percent: u8,
    pub is_paused: bool,
    pub is_processing: bool,
}

/// Answer to [`DownloadQueueManager::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerStatus {
    pub session: Option<SessionSnapshot>,
    pub queue: Vec<QueueItem>,
    /// Set by [`DownloadQueueManager::stop`] until the next start.
    pub halted: bool,
}

struct ActiveSession {
    hash: String,
    generation: u64,
    control: TransferControl,
    progress: Arc<TransferProgress>,
    shared: Arc<SessionShared>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    items: Vec<QueueItem>,
    active: Option<ActiveSession>,
    halted: bool,
    draining: bool,
    generation: u64,
    speed_limit: Option<u64>,
}

impl ManagerState {
    fn item_mut(&mut self, hash: &str) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.content_hash == hash)
    }

    fn set_status(&mut self, hash: &str, status: QueueStatus) {
        if let Some(item) = self.item_mut(hash) {
            item.status = status;
        }
    }
}

struct Inner {
    store: Arc<QueueStore>,
    sites: SiteResolver,
    registry: Arc<ProviderRegistry>,
    downloader: SegmentedDownloader,
    finalizer: Finalizer,
    emitter: EventEmitter,
    state: Mutex<ManagerState>,
    idle: watch::Sender<bool>,
}

impl Inner {
    /// Writes `items` on the blocking pool; the caller keeps the state lock
    /// so saves land in mutation order.
    async fn persist(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        let store = Arc::clone(&self.store);
        let items = items.to_vec();
        tokio::task::spawn_blocking(move || store.save(&items))
            .await
            .map_err(|e| QueueError::io(self.store.path(), std::io::Error::other(e)))?
    }

    /// Saves from a background path where there is no caller to report to.
    async fn persist_logged(&self, items: &[QueueItem]) {
        if let Err(e) = self.persist(items).await {
            warn!(error = %e, "failed to persist queue");
        }
    }
}

/// Cloneable handle to the one queue manager of the process.
#[derive(Clone)]
pub struct DownloadQueueManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueueManager")
            .field("queue", &self.inner.store.path())
            .finish_non_exhaustive()
    }
}

impl DownloadQueueManager {
    /// Loads the persisted queue. Items left mid-session by a previous run
    /// go back to `queued`; their part files are picked up on resume.
    ///
    /// Nothing starts until [`Self::start`] or [`Self::enqueue`].
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Queue`] when the queue file is unreadable.
    pub fn new(parts: ManagerParts) -> Result<Self, ManagerError> {
        let mut items = parts.store.load()?;
        let mut recovered = 0_usize;
        for item in &mut items {
            if item.status.is_active() {
                item.status = QueueStatus::Queued;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "requeued items interrupted by a previous run");
            parts.store.save(&items)?;
        }
        debug!(items = items.len(), path = %parts.store.path().display(), "queue loaded");

        let (idle, _) = watch::channel(true);
        let state = ManagerState {
            items,
            speed_limit: parts.speed_limit,
            ..ManagerState::default()
        };
        Ok(Self {
            inner: Arc::new(Inner {
                store: Arc::new(parts.store),
                sites: parts.sites,
                registry: parts.registry,
                downloader: parts.downloader,
                finalizer: parts.finalizer,
                emitter: parts.emitter,
                state: Mutex::new(state),
                idle,
            }),
        })
    }

    #[must_use]
    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    /// Clears a previous [`Self::stop`] and starts the head. A head left
    /// `stopped` is requeued; one in `error` waits for [`Self::retry`].
    pub async fn start(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.halted = false;
            if state.active.is_none()
                && let Some(head) = state.items.first_mut()
                && head.status == QueueStatus::Stopped
            {
                head.status = QueueStatus::Queued;
                self.inner.persist_logged(&state.items).await;
            }
        }
        self.advance().await;
    }

    /// Appends `content_url` unless an item with the same hash exists.
    ///
    /// `alias` defaults to a name derived from the URL.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Queue`] when the queue cannot be saved.
    #[instrument(skip(self), fields(url = %content_url))]
    pub async fn enqueue(
        &self,
        content_url: &str,
        alias: Option<&str>,
        source: &str,
    ) -> Result<EnqueueResult, ManagerError> {
        let hash = content_hash(content_url);
        {
            let mut state = self.inner.state.lock().await;
            if state.items.iter().any(|item| item.content_hash == hash) {
                debug!(hash = %hash, "already queued");
                return Ok(EnqueueResult::AlreadyQueued(hash));
            }
            let alias = alias
                .map(str::to_string)
                .or_else(|| name_from_url(content_url))
                .unwrap_or_else(|| hash.clone());
            let mut items = state.items.clone();
            items.push(QueueItem::new(content_url, &alias, source));
            self.inner.persist(&items).await?;
            state.items = items;
            info!(hash = %hash, alias = %alias, position = state.items.len(), "enqueued");
        }
        self.inner.emitter.status(&hash, "Queued");
        self.advance().await;
        Ok(EnqueueResult::Added(hash))
    }

    /// Re-sequences the queue by `order`. When the new head is not the
    /// running item, the running session is stopped and the head started.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Queue`] when the queue cannot be saved.
    #[instrument(skip(self, order), fields(entries = order.len()))]
    pub async fn reorder(&self, order: &[String]) -> Result<(), ManagerError> {
        let preempted = {
            let mut state = self.inner.state.lock().await;
            let items = apply_order(state.items.clone(), order);
            self.inner.persist(&items).await?;
            state.items = items;

            let head = state.items.first().map(|item| item.content_hash.clone());
            let superseded = state
                .active
                .as_ref()
                .is_some_and(|active| Some(&active.hash) != head.as_ref());
            if superseded {
                state.active.take().map(|active| {
                    info!(hash = %active.hash, "reorder moved a new item to the head; preempting");
                    state.set_status(&active.hash, QueueStatus::Queued);
                    state.draining = true;
                    active
                })
            } else {
                None
            }
        };

        if let Some(active) = preempted {
            self.inner.emitter.status(&active.hash, "Queued");
            self.drain(active, QueueStatus::Queued).await;
        }
        self.advance().await;
        Ok(())
    }

    /// Removes `hash` from the queue, stopping it first when it is running,
    /// and deletes its cache files.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Queue`] when the item is unknown or the
    /// queue cannot be saved, and [`ManagerError::Io`] when the cache
    /// directory cannot be listed.
    #[instrument(skip(self))]
    pub async fn remove(&self, hash: &str) -> Result<usize, ManagerError> {
        let active = {
            let mut state = self.inner.state.lock().await;
            if !state.items.iter().any(|item| item.content_hash == hash) {
                return Err(QueueError::item_not_found(hash).into());
            }
            let is_active = state.active.as_ref().is_some_and(|a| a.hash == hash);
            if is_active {
                state.draining = true;
                state.active.take()
            } else {
                None
            }
        };
        if let Some(active) = active {
            self.drain(active, QueueStatus::Stopped).await;
        }

        {
            let mut state = self.inner.state.lock().await;
            let items: Vec<QueueItem> = state
                .items
                .iter()
                .filter(|item| item.content_hash != hash)
                .cloned()
                .collect();
            self.inner.persist(&items).await?;
            state.items = items;
        }
        let deleted = remove_cache_files(self.inner.downloader.cache_dir(), hash).await?;
        info!(deleted, "removed from queue");
        self.advance().await;
        Ok(deleted)
    }

    /// Returns an `error` or `stopped` item to `queued` and clears a halt.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Queue`] when the item is unknown or the
    /// queue cannot be saved.
    pub async fn retry(&self, hash: &str) -> Result<(), ManagerError> {
        {
            let mut state = self.inner.state.lock().await;
            let mut items = state.items.clone();
            let item = items
                .iter_mut()
                .find(|item| item.content_hash == hash)
                .ok_or_else(|| QueueError::item_not_found(hash))?;
            if item.status.needs_attention() {
                item.status = QueueStatus::Queued;
            }
            self.inner.persist(&items).await?;
            state.items = items;
            state.halted = false;
        }
        self.advance().await;
        Ok(())
    }

    /// Pauses the running transfer. Returns false when nothing is running.
    pub async fn pause(&self) -> bool {
        let state = self.inner.state.lock().await;
        let Some(active) = state.active.as_ref() else {
            return false;
        };
        active.control.pause();
        self.inner.emitter.status(&active.hash, "Paused");
        true
    }

    /// Resumes a paused transfer. Returns false when nothing is running.
    pub async fn resume(&self) -> bool {
        let state = self.inner.state.lock().await;
        let Some(active) = state.active.as_ref() else {
            return false;
        };
        active.control.resume();
        self.inner.emitter.status(&active.hash, "Resumed");
        true
    }

    /// Stops the running session, keeping its part files, and halts the
    /// queue until [`Self::start`] or [`Self::retry`].
    pub async fn stop(&self) {
        let active = {
            let mut state = self.inner.state.lock().await;
            state.halted = true;
            let active = state.active.take();
            if active.is_some() {
                state.draining = true;
            }
            active
        };
        match active {
            Some(active) => {
                info!(hash = %active.hash, "stopping active download");
                self.inner.emitter.status(&active.hash, "Stopped");
                self.drain(active, QueueStatus::Stopped).await;
            }
            None => {
                self.inner.idle.send_replace(true);
            }
        }
    }

    /// Changes the global cap; running workers pick it up on their next chunk.
    pub async fn set_speed_limit(&self, bytes_per_sec: Option<u64>) {
        let limit = bytes_per_sec.filter(|&b| b > 0);
        let mut state = self.inner.state.lock().await;
        state.speed_limit = limit;
        if let Some(active) = state.active.as_ref() {
            active.control.set_speed_limit(limit);
        }
        debug!(?limit, "speed limit updated");
    }

    pub async fn status(&self) -> ManagerStatus {
        let state = self.inner.state.lock().await;
        let session = state.active.as_ref().and_then(|active| {
            let item = state.items.iter().find(|i| i.content_hash == active.hash)?;
            let snapshot = active.progress.snapshot();
            let bytes_per_sec = active.shared.speed(snapshot.bytes_downloaded);
            Some(SessionSnapshot {
                content_url: item.content_url.clone(),
                alias: item.display_alias.clone(),
                hash: active.hash.clone(),
                status: item.status,
                provider: active.shared.provider(),
                target_dir: self.inner.finalizer.target_dir().to_path_buf(),
                total_size: snapshot.total_size,
                bytes_downloaded: snapshot.bytes_downloaded,
                bytes_per_sec,
                remaining: remaining_time(
                    snapshot.total_size.saturating_sub(snapshot.bytes_downloaded),
                    bytes_per_sec,
                ),
                progress_percent: snapshot.percent(),
                is_paused: active.control.is_paused(),
                is_processing: active.shared.stage() == SessionStage::Processing,
            })
        });
        ManagerStatus {
            session,
            queue: state.items.clone(),
            halted: state.halted,
        }
    }

    /// Queue contents in processing order.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.inner.state.lock().await.items.clone()
    }

    /// Deletes everything in the cache directory and returns how many
    /// entries were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Busy`] while a session is running and
    /// [`ManagerError::Io`] when the directory cannot be listed.
    #[instrument(skip(self))]
    pub async fn wipe_cache(&self) -> Result<usize, ManagerError> {
        let state = self.inner.state.lock().await;
        if state.active.is_some() || state.draining {
            return Err(ManagerError::Busy);
        }
        let cache_dir = self.inner.downloader.cache_dir();
        let mut entries = match tokio::fs::read_dir(cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ManagerError::io(cache_dir, e)),
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ManagerError::io(cache_dir, e))?
        {
            let path = entry.path();
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "could not delete cache entry"),
            }
        }
        info!(removed, "cache wiped");
        Ok(removed)
    }

    /// Resolves once no session is running and none can start: the queue
    /// is empty, halted, or stalled behind an item that needs attention.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Starts the head item when the slot is free and the head is queued.
    async fn advance(&self) {
        let mut state = self.inner.state.lock().await;
        if state.active.is_some() || state.draining {
            return;
        }
        if state.halted {
            self.inner.idle.send_replace(true);
            return;
        }
        let Some(head) = state.items.first().cloned() else {
            self.inner.idle.send_replace(true);
            return;
        };
        if head.status != QueueStatus::Queued {
            debug!(hash = %head.content_hash, status = %head.status, "head needs attention; queue stalled");
            self.inner.idle.send_replace(true);
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let control = TransferControl::new(state.speed_limit);
        let progress = Arc::new(TransferProgress::new(
            head.content_hash.clone(),
            self.inner.emitter.clone(),
        ));
        let shared = Arc::new(SessionShared::new());
        state.set_status(&head.content_hash, QueueStatus::Resolving);
        self.inner.persist_logged(&state.items).await;
        self.inner.idle.send_replace(false);

        info!(hash = %head.content_hash, alias = %head.display_alias, "starting download");
        let hash = head.content_hash.clone();
        let task = SessionTask {
            item: head,
            generation,
            control: control.clone(),
            progress: Arc::clone(&progress),
            shared: Arc::clone(&shared),
        };
        let handle = tokio::spawn(task.run(self.clone()));
        state.active = Some(ActiveSession {
            hash,
            generation,
            control,
            progress,
            shared,
            handle,
        });
    }

    /// Persists the stage of the session `generation` if it is still current.
    async fn record_stage(&self, generation: u64, hash: &str, stage: SessionStage) {
        let mut state = self.inner.state.lock().await;
        if state.active.as_ref().is_none_or(|a| a.generation != generation) {
            return;
        }
        let status = match stage {
            SessionStage::Resolving => QueueStatus::Resolving,
            SessionStage::Downloading => QueueStatus::Downloading,
            SessionStage::Processing => QueueStatus::Processing,
        };
        state.set_status(hash, status);
        self.inner.persist_logged(&state.items).await;
    }

    /// Replaces an alias that was only derived from the URL at enqueue time
    /// with the name the content page resolved to. Returns whether it did.
    async fn adopt_site_name(&self, generation: u64, hash: &str, name: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.active.as_ref().is_none_or(|a| a.generation != generation) {
            return false;
        }
        let Some(item) = state.item_mut(hash) else {
            return false;
        };
        let derived = name_from_url(&item.content_url).unwrap_or_else(|| hash.to_string());
        if item.display_alias != derived || item.display_alias == name {
            return false;
        }
        info!(hash, from = %item.display_alias, to = %name, "adopting site name");
        item.display_alias = name.to_string();
        self.inner.persist_logged(&state.items).await;
        true
    }

    /// Called by the session task as its last act.
    async fn session_finished(
        &self,
        generation: u64,
        hash: &str,
        outcome: Result<PathBuf, SessionError>,
    ) {
        {
            let mut state = self.inner.state.lock().await;
            if state.active.as_ref().is_none_or(|a| a.generation != generation) {
                // Preempted: whoever took the slot owns the follow-up.
                return;
            }
            state.active = None;
            match outcome {
                Ok(path) => {
                    state.items.retain(|item| item.content_hash != hash);
                    self.inner.persist_logged(&state.items).await;
                    info!(hash, path = %path.display(), "item complete");
                    self.inner.emitter.emit(hash, EventKind::Complete { path });
                }
                Err(SessionError::Stopped) => {
                    state.set_status(hash, QueueStatus::Stopped);
                    self.inner.persist_logged(&state.items).await;
                }
                Err(e) => {
                    warn!(hash, stage = ?e.stage(), provider = ?e.provider(), error = %e, "download failed");
                    state.set_status(hash, QueueStatus::Error);
                    self.inner.persist_logged(&state.items).await;
                    self.inner.emitter.error(hash, e.to_string());
                }
            }
        }
        self.advance().await;
    }

    /// Cancels a session taken out of the active slot, waits for its task,
    /// then records `status` for it and frees the slot.
    async fn drain(&self, active: ActiveSession, status: QueueStatus) {
        active.control.stop();
        if let Err(e) = active.handle.await
            && e.is_panic()
        {
            warn!(hash = %active.hash, "session task panicked");
        }
        let mut state = self.inner.state.lock().await;
        state.draining = false;
        state.set_status(&active.hash, status);
        self.inner.persist_logged(&state.items).await;
        if state.halted {
            self.inner.idle.send_replace(true);
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn remaining_time(remaining_bytes: u64, bytes_per_sec: f64) -> Option<Duration> {
    if remaining_bytes == 0 || bytes_per_sec <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(remaining_bytes as f64 / bytes_per_sec))
}

/// Deletes files in `cache_dir` whose name starts with `hash`.
async fn remove_cache_files(cache_dir: &Path, hash: &str) -> Result<usize, ManagerError> {
    let mut entries = match tokio::fs::read_dir(cache_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ManagerError::io(cache_dir, e)),
    };
    let mut deleted = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ManagerError::io(cache_dir, e))?
    {
        if !entry.file_name().to_string_lossy().starts_with(hash) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "could not delete cache file"),
        }
    }
    Ok(deleted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_time_needs_speed_and_bytes() {
        assert_eq!(remaining_time(0, 100.0), None);
        assert_eq!(remaining_time(100, 0.0), None);
        assert_eq!(remaining_time(1_000, 250.0), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_remove_cache_files_matches_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["abc_part_0", "abc_part_1", "abc.rar", "abc_plan.json", "xyz_part_0"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let deleted = remove_cache_files(dir.path(), "abc").await.unwrap();
        assert_eq!(deleted, 4);
        assert!(dir.path().join("xyz_part_0").exists());
    }

    #[tokio::test]
    async fn test_remove_cache_files_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(remove_cache_files(&dir.path().join("nope"), "abc").await.unwrap(), 0);
    }
}
