//! Segmented, resumable transfer of one resolved link into the cache.
//!
//! # Overview
//!
//! [`SegmentedDownloader::execute`] runs a single transfer:
//!
//! 1. Probe the link for size and range support.
//! 2. Reuse a cached artifact whose size already matches.
//! 3. Hand plain links to an external accelerator when one is configured;
//!    if it fails, its output is discarded and the internal path takes over.
//! 4. Otherwise split the file into byte ranges, one part file per worker,
//!    resuming each part from its current size. Workers start staggered by
//!    the provider's inter-worker delay.
//! 5. On the first worker failure, cancel the siblings and report
//!    [`DownloadError::SegmentFailed`]; parts stay on disk for a retry.
//! 6. Once every part is complete, concatenate them in index order into the
//!    artifact and delete them. A stopped transfer is never merged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Response;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::accelerator::{AcceleratorJob, ExternalAccelerator};
use super::client::{DownloadClient, ProbeOutcome};
use super::constants::{MAX_WORKERS, SYNC_INTERVAL_BYTES};
use super::control::TransferControl;
use super::error::DownloadError;
use super::progress::TransferProgress;
use super::segment::{
    SegmentState, artifact_file_name, clear_plan, part_file_name, plan_segments,
};
use super::throttle::{SpeedPacer, per_worker_quota};
use crate::events::{EventEmitter, EventKind};
use crate::provider::ResolvedLink;

/// A complete file in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub file_extension: String,
}

/// Runs transfers into a cache directory.
#[derive(Clone)]
pub struct SegmentedDownloader {
    client: DownloadClient,
    cache_dir: PathBuf,
    emitter: EventEmitter,
    accelerator: Option<Arc<dyn ExternalAccelerator>>,
}

impl std::fmt::Debug for SegmentedDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedDownloader")
            .field("cache_dir", &self.cache_dir)
            .field("accelerator", &self.accelerator.as_ref().map(|a| a.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl SegmentedDownloader {
    #[must_use]
    pub fn new(client: DownloadClient, cache_dir: impl Into<PathBuf>, emitter: EventEmitter) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
            emitter,
            accelerator: None,
        }
    }

    #[must_use]
    pub fn with_accelerator(mut self, accelerator: Arc<dyn ExternalAccelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Transfers `link` into `{cache_dir}/{hash}.{ext}`.
    ///
    /// # Errors
    ///
    /// - host failures from the probe ([`DownloadError::is_host_failure`])
    /// - [`DownloadError::SegmentFailed`] when a worker fails mid-transfer
    /// - [`DownloadError::MergeFailed`] / [`DownloadError::Integrity`] after transfer
    /// - [`DownloadError::Stopped`] when `control` is stopped
    #[instrument(skip(self, link, control, progress), fields(provider = %link.provider_key, hash = %hash))]
    pub async fn execute(
        &self,
        link: &ResolvedLink,
        hash: &str,
        control: &TransferControl,
        progress: &Arc<TransferProgress>,
    ) -> Result<Artifact, DownloadError> {
        if control.is_stopped() {
            return Err(DownloadError::Stopped);
        }
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| DownloadError::io(&self.cache_dir, e))?;

        let probe = tokio::select! {
            () = control.cancellation().cancelled() => return Err(DownloadError::Stopped),
            probe = self.client.probe(link) => probe?,
        };
        let total = probe.total_size.unwrap_or(0);
        let file_name = artifact_file_name(hash, &link.file_extension);
        let artifact_path = self.cache_dir.join(&file_name);
        progress.set_total(total);
        self.emitter.emit(
            hash,
            EventKind::Meta {
                total_size: total,
                filename: file_name.clone(),
            },
        );

        let artifact = Artifact {
            path: artifact_path.clone(),
            size: total,
            file_extension: link.file_extension.clone(),
        };

        if total > 0 && file_len(&artifact_path).await == Some(total) {
            info!(path = %artifact_path.display(), "artifact already cached");
            progress.record_percent(100);
            progress.flush();
            return Ok(artifact);
        }

        if let Some(accelerator) = self.accelerator.as_ref().filter(|_| link.is_plain_get()) {
            match self
                .run_accelerator(accelerator.as_ref(), link, &file_name, &probe, control, progress)
                .await
            {
                Ok(size) => return Ok(Artifact { size, ..artifact }),
                Err(DownloadError::Stopped) => return Err(DownloadError::Stopped),
                Err(error) => {
                    warn!(error = %error, "accelerator failed; falling back to internal transfer");
                    discard_file(&artifact_path).await;
                    discard_file(&aria2_control_path(&artifact_path)).await;
                    progress.reset();
                }
            }
        }

        let size = if probe.is_segmentable() {
            let workers = link.worker_count.clamp(1, MAX_WORKERS);
            self.run_segments(link, hash, total, workers, &artifact_path, control, progress)
                .await?
        } else {
            debug!(
                supports_ranges = probe.supports_ranges,
                total, "single-stream transfer without resume"
            );
            self.run_single(link, hash, total, &artifact_path, control, progress)
                .await?
        };
        progress.flush();
        Ok(Artifact { size, ..artifact })
    }

    async fn run_accelerator(
        &self,
        accelerator: &dyn ExternalAccelerator,
        link: &ResolvedLink,
        file_name: &str,
        probe: &ProbeOutcome,
        control: &TransferControl,
        progress: &TransferProgress,
    ) -> Result<u64, DownloadError> {
        let job = AcceleratorJob {
            url: &link.direct_url,
            output_dir: &self.cache_dir,
            file_name,
            connections: link.worker_count,
            speed_limit: control.speed_limit(),
        };
        accelerator.fetch(job, control, progress).await?;
        let path = self.cache_dir.join(file_name);
        let actual = file_len(&path).await.unwrap_or(0);
        match probe.total_size {
            Some(expected) if expected != actual => {
                Err(DownloadError::integrity(path, expected, actual))
            }
            _ => Ok(actual),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_segments(
        &self,
        link: &ResolvedLink,
        hash: &str,
        total: u64,
        workers: usize,
        artifact_path: &Path,
        control: &TransferControl,
        progress: &Arc<TransferProgress>,
    ) -> Result<u64, DownloadError> {
        let segments = plan_segments(&self.cache_dir, hash, total, workers).await?;
        for segment in &segments {
            progress.seed(segment.index, segment.bytes_written);
        }
        let pending: Vec<SegmentState> =
            segments.iter().filter(|s| !s.is_complete()).cloned().collect();
        info!(
            workers = segments.len(),
            pending = pending.len(),
            total,
            "starting segmented transfer"
        );

        // Siblings are cancelled through a child token so a worker failure
        // does not read as a user stop.
        let abort = control.cancellation().child_token();
        let mut tasks = JoinSet::new();
        for (position, segment) in pending.into_iter().enumerate() {
            let worker = Worker {
                client: self.client.clone(),
                link: link.clone(),
                control: control.clone(),
                abort: abort.clone(),
                progress: Arc::clone(progress),
                workers: segments.len(),
            };
            let delay = stagger(link.inter_worker_delay, position);
            tasks.spawn(async move {
                let index = segment.index;
                let result = worker.run(segment, delay).await;
                (index, result)
            });
        }

        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((index, Err(error))) => (index, error),
                Err(join_error) => (
                    usize::MAX,
                    DownloadError::io(&self.cache_dir, std::io::Error::other(join_error)),
                ),
            };
            if first_error.is_none() && !failure.1.is_stopped() {
                warn!(index = failure.0, error = %failure.1, "segment failed; cancelling siblings");
                abort.cancel();
                first_error = Some(DownloadError::segment(failure.0, failure.1));
            }
        }

        if control.is_stopped() {
            info!("transfer stopped; parts kept for resume");
            return Err(DownloadError::Stopped);
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        merge_parts(&segments, artifact_path).await?;
        clear_plan(&self.cache_dir, hash).await;
        verify_size(artifact_path, total).await
    }

    async fn run_single(
        &self,
        link: &ResolvedLink,
        hash: &str,
        total: u64,
        artifact_path: &Path,
        control: &TransferControl,
        progress: &Arc<TransferProgress>,
    ) -> Result<u64, DownloadError> {
        let part_path = self.cache_dir.join(part_file_name(hash, 0));
        let worker = Worker {
            client: self.client.clone(),
            link: link.clone(),
            control: control.clone(),
            abort: control.cancellation().child_token(),
            progress: Arc::clone(progress),
            workers: 1,
        };
        let response = worker.open(None).await?;
        let mut file = File::create(&part_path)
            .await
            .map_err(|e| DownloadError::io(&part_path, e))?;
        let limit = (total > 0).then_some(total);
        worker.pump(response, &mut file, &part_path, 0, limit).await?;
        drop(file);

        if control.is_stopped() {
            return Err(DownloadError::Stopped);
        }
        tokio::fs::rename(&part_path, artifact_path)
            .await
            .map_err(|e| DownloadError::merge(artifact_path, e))?;
        if total == 0 {
            return Ok(file_len(artifact_path).await.unwrap_or(0));
        }
        verify_size(artifact_path, total).await
    }
}

fn stagger(delay: Duration, position: usize) -> Duration {
    delay.saturating_mul(u32::try_from(position).unwrap_or(u32::MAX))
}

/// Everything one segment worker needs, owned so it can move into a task.
struct Worker {
    client: DownloadClient,
    link: ResolvedLink,
    control: TransferControl,
    abort: CancellationToken,
    progress: Arc<TransferProgress>,
    workers: usize,
}

impl Worker {
    async fn run(self, segment: SegmentState, delay: Duration) -> Result<(), DownloadError> {
        if !delay.is_zero() {
            tokio::select! {
                () = self.abort.cancelled() => return Err(DownloadError::Stopped),
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.checkpoint().await?;

        let response = self
            .open(Some((segment.resume_offset(), segment.byte_end)))
            .await?;
        let path = &segment.part_file_path;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        debug!(index = segment.index, range = %segment.range_header(), "segment worker started");

        let written = self
            .pump(response, &mut file, path, segment.index, Some(segment.remaining()))
            .await?;
        if written < segment.remaining() {
            return Err(DownloadError::integrity(
                path,
                segment.len(),
                segment.bytes_written + written,
            ));
        }
        Ok(())
    }

    async fn open(&self, range: Option<(u64, u64)>) -> Result<Response, DownloadError> {
        tokio::select! {
            () = self.abort.cancelled() => Err(DownloadError::Stopped),
            response = self.client.open(&self.link, range) => response,
        }
    }

    /// Blocks while paused; fails once the transfer or its siblings abort.
    async fn checkpoint(&self) -> Result<(), DownloadError> {
        if self.abort.is_cancelled() {
            return Err(DownloadError::Stopped);
        }
        tokio::select! {
            () = self.abort.cancelled() => Err(DownloadError::Stopped),
            paused = self.control.wait_while_paused() => paused,
        }
    }

    /// Streams the body into `file`, at most `limit` bytes. Returns bytes written.
    async fn pump(
        &self,
        response: Response,
        file: &mut File,
        path: &Path,
        index: usize,
        limit: Option<u64>,
    ) -> Result<u64, DownloadError> {
        let url = self.link.direct_url.as_str();
        let mut stream = response.bytes_stream();
        let mut pacer = SpeedPacer::new();
        let mut written: u64 = 0;
        let mut unsynced: u64 = 0;

        let outcome = loop {
            if let Err(stopped) = self.checkpoint().await {
                break Err(stopped);
            }
            let next = tokio::select! {
                () = self.abort.cancelled() => break Err(DownloadError::Stopped),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break Ok(()),
                Some(Err(error)) => break Err(DownloadError::from_request(url, error)),
                Some(Ok(chunk)) => chunk,
            };

            let mut data = &chunk[..];
            if let Some(limit) = limit {
                let room = usize::try_from(limit - written).unwrap_or(usize::MAX);
                data = &data[..data.len().min(room)];
            }
            if let Err(error) = file.write_all(data).await {
                break Err(DownloadError::io(path, error));
            }
            let n = data.len() as u64;
            written += n;
            unsynced += n;
            self.progress.record(index, n);

            if unsynced >= SYNC_INTERVAL_BYTES {
                if let Err(error) = sync(file).await {
                    break Err(DownloadError::io(path, error));
                }
                unsynced = 0;
            }
            if limit.is_some_and(|limit| written >= limit) {
                break Ok(());
            }

            let quota = per_worker_quota(self.control.speed_limit(), self.workers);
            let delay = pacer.record(n, quota);
            if !delay.is_zero() {
                // A new limit ends the wait; the next chunk is paced against it.
                tokio::select! {
                    () = self.abort.cancelled() => break Err(DownloadError::Stopped),
                    () = self.control.speed_limit_changed() => {}
                    () = tokio::time::sleep(delay) => {}
                }
            }
        };

        // Bytes already written stay durable whatever the outcome.
        if let Err(error) = sync(file).await {
            warn!(path = %path.display(), error = %error, "final part sync failed");
            outcome?;
            return Err(DownloadError::io(path, error));
        }
        outcome.map(|()| written)
    }
}

async fn sync(file: &mut File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_data().await
}

/// Concatenates part files in index order into `artifact_path`, then deletes them.
///
/// The merge writes to a sibling temp file and renames it into place, so a
/// crash mid-merge leaves every part intact.
///
/// # Errors
///
/// Returns [`DownloadError::MergeFailed`] on any I/O failure.
pub async fn merge_parts(
    segments: &[SegmentState],
    artifact_path: &Path,
) -> Result<(), DownloadError> {
    let mut ordered: Vec<&SegmentState> = segments.iter().collect();
    ordered.sort_by_key(|s| s.index);

    let merging = merging_path(artifact_path);
    let merge = async {
        let mut out = File::create(&merging).await?;
        for segment in &ordered {
            let mut part = File::open(&segment.part_file_path).await?;
            tokio::io::copy(&mut part, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&merging, artifact_path).await
    };
    if let Err(error) = merge.await {
        discard_file(&merging).await;
        return Err(DownloadError::merge(artifact_path, error));
    }

    for segment in ordered {
        discard_file(&segment.part_file_path).await;
    }
    info!(path = %artifact_path.display(), parts = segments.len(), "merged parts");
    Ok(())
}

async fn verify_size(path: &Path, expected: u64) -> Result<u64, DownloadError> {
    let actual = file_len(path).await.unwrap_or(0);
    if actual != expected {
        discard_file(path).await;
        return Err(DownloadError::integrity(path, expected, actual));
    }
    Ok(actual)
}

fn merging_path(artifact_path: &Path) -> PathBuf {
    let mut name = artifact_path.as_os_str().to_owned();
    name.push(".merging");
    PathBuf::from(name)
}

fn aria2_control_path(artifact_path: &Path) -> PathBuf {
    let mut name = artifact_path.as_os_str().to_owned();
    name.push(".aria2");
    PathBuf::from(name)
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|meta| meta.len())
}

async fn discard_file(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %error, "could not remove file");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn segment(dir: &Path, index: usize, start: u64, end: u64) -> SegmentState {
        SegmentState {
            index,
            byte_start: start,
            byte_end: end,
            part_file_path: dir.join(part_file_name("h", index)),
            bytes_written: end - start + 1,
        }
    }

    #[tokio::test]
    async fn test_merge_orders_by_index_and_removes_parts() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![
            segment(dir.path(), 2, 6, 8),
            segment(dir.path(), 0, 0, 2),
            segment(dir.path(), 1, 3, 5),
        ];
        tokio::fs::write(&segments[0].part_file_path, b"ghi").await.unwrap();
        tokio::fs::write(&segments[1].part_file_path, b"abc").await.unwrap();
        tokio::fs::write(&segments[2].part_file_path, b"def").await.unwrap();

        let artifact = dir.path().join("h.rar");
        merge_parts(&segments, &artifact).await.unwrap();

        assert_eq!(tokio::fs::read(&artifact).await.unwrap(), b"abcdefghi");
        assert!(segments.iter().all(|s| !s.part_file_path.exists()));
        assert!(!merging_path(&artifact).exists());
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_parts() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![segment(dir.path(), 0, 0, 2), segment(dir.path(), 1, 3, 5)];
        tokio::fs::write(&segments[0].part_file_path, b"abc").await.unwrap();

        let artifact = dir.path().join("h.rar");
        let err = merge_parts(&segments, &artifact).await.unwrap_err();
        assert!(matches!(err, DownloadError::MergeFailed { .. }));
        assert!(segments[0].part_file_path.exists());
        assert!(!artifact.exists());
    }

    #[test]
    fn test_stagger_scales_with_position() {
        assert_eq!(stagger(Duration::from_millis(500), 0), Duration::ZERO);
        assert_eq!(stagger(Duration::from_millis(500), 3), Duration::from_millis(1500));
    }
}
