//! Integration tests for the segmented downloader.
//!
//! A mock host serves a fixed body with range support; each test drives
//! `SegmentedDownloader::execute` against a temp cache directory.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use vaultdl_core::download::{
    AcceleratorJob, DownloadClient, DownloadError, ExternalAccelerator, SegmentedDownloader,
    TransferControl, TransferProgress, part_file_name,
};
use vaultdl_core::events::{EventEmitter, EventKind};
use vaultdl_core::provider::ResolvedLink;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

mod support;
use support::range_server::{RangeResponder, payload, range_headers, sha256_hex};
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

const HASH: &str = "0123456789abcdef0123456789abcdef";

async fn serve(server: &MockServer, responder: RangeResponder) {
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(responder)
        .mount(server)
        .await;
}

fn link(server: &MockServer, workers: usize) -> ResolvedLink {
    let mut link = ResolvedLink::get("buzzheavier", format!("{}/file.bin", server.uri()))
        .with_extension("bin");
    link.worker_count = workers;
    link
}

fn downloader(cache: &Path, emitter: &EventEmitter) -> SegmentedDownloader {
    SegmentedDownloader::new(DownloadClient::new().unwrap(), cache, emitter.clone())
}

fn progress(emitter: &EventEmitter) -> Arc<TransferProgress> {
    Arc::new(TransferProgress::new(HASH, emitter.clone()))
}

#[tokio::test]
async fn test_multi_worker_download_matches_source() {
    let server = require_mock_server!();
    let body = payload(10_007);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let mut events = emitter.subscribe();
    let artifact = downloader(cache.path(), &emitter)
        .execute(&link(&server, 4), HASH, &TransferControl::default(), &progress(&emitter))
        .await
        .unwrap();

    assert_eq!(artifact.path, cache.path().join(format!("{HASH}.bin")));
    assert_eq!(artifact.size, 10_007);
    assert_eq!(sha256_hex(&std::fs::read(&artifact.path).unwrap()), sha256_hex(&body));
    for index in 0..4 {
        assert!(!cache.path().join(part_file_name(HASH, index)).exists());
    }

    let first = events.recv().await.unwrap();
    assert_eq!(
        first.kind,
        EventKind::Meta {
            total_size: 10_007,
            filename: format!("{HASH}.bin"),
        }
    );
    let mut last_progress = None;
    while let Ok(event) = events.try_recv() {
        if let EventKind::Progress(p) = event.kind {
            last_progress = Some(p);
        }
    }
    assert_eq!(last_progress, Some(100));
}

#[tokio::test]
async fn test_resume_requests_only_missing_bytes() {
    let server = require_mock_server!();
    let body = payload(1_000);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    std::fs::write(cache.path().join(part_file_name(HASH, 0)), &body[..100]).unwrap();
    std::fs::write(cache.path().join(part_file_name(HASH, 1)), &body[500..650]).unwrap();

    let emitter = EventEmitter::default();
    let artifact = downloader(cache.path(), &emitter)
        .execute(&link(&server, 2), HASH, &TransferControl::default(), &progress(&emitter))
        .await
        .unwrap();

    let mut ranges = range_headers(&server.received_requests().await.unwrap());
    ranges.sort();
    assert_eq!(ranges, vec!["bytes=0-0", "bytes=100-499", "bytes=650-999"]);
    assert_eq!(std::fs::read(&artifact.path).unwrap(), body);
}

#[tokio::test]
async fn test_pause_then_resume_produces_same_artifact() {
    let server = require_mock_server!();
    let body = payload(4_096);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let control = TransferControl::default();
    let progress = progress(&emitter);
    control.pause();

    let task = {
        let downloader = downloader(cache.path(), &emitter);
        let link = link(&server, 3);
        let control = control.clone();
        let progress = Arc::clone(&progress);
        tokio::spawn(async move { downloader.execute(&link, HASH, &control, &progress).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!task.is_finished());
    assert_eq!(progress.snapshot().bytes_downloaded, 0);
    assert_eq!(progress.snapshot().total_size, 4_096);

    control.resume();
    let artifact = task.await.unwrap().unwrap();
    assert_eq!(sha256_hex(&std::fs::read(&artifact.path).unwrap()), sha256_hex(&body));
}

#[tokio::test]
async fn test_speed_limit_paces_transfer() {
    let server = require_mock_server!();
    let body = payload(256 * 1024);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let control = TransferControl::new(Some(64 * 1024));
    let started = std::time::Instant::now();
    let artifact = downloader(cache.path(), &emitter)
        .execute(&link(&server, 1), HASH, &control, &progress(&emitter))
        .await
        .unwrap();

    // Four seconds unthrottled; allow for bursts at window edges.
    assert!(started.elapsed() >= Duration::from_secs(1), "took {:?}", started.elapsed());
    assert_eq!(sha256_hex(&std::fs::read(&artifact.path).unwrap()), sha256_hex(&body));
}

#[tokio::test]
async fn test_lifting_speed_limit_mid_transfer_takes_effect() {
    let server = require_mock_server!();
    let body = payload(512 * 1024);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let control = TransferControl::new(Some(16 * 1024));
    let progress = progress(&emitter);

    let task = {
        let downloader = downloader(cache.path(), &emitter);
        let link = link(&server, 1);
        let control = control.clone();
        let progress = Arc::clone(&progress);
        tokio::spawn(async move { downloader.execute(&link, HASH, &control, &progress).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!task.is_finished());
    assert!(progress.snapshot().bytes_downloaded < 256 * 1024);

    control.set_speed_limit(None);
    let artifact = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("lifted limit should let the transfer finish promptly")
        .unwrap()
        .unwrap();
    assert_eq!(sha256_hex(&std::fs::read(&artifact.path).unwrap()), sha256_hex(&body));
}

#[tokio::test]
async fn test_stop_keeps_parts_and_never_merges() {
    let server = require_mock_server!();
    let body = payload(2_000);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    let part0 = cache.path().join(part_file_name(HASH, 0));
    std::fs::write(&part0, &body[..250]).unwrap();

    let emitter = EventEmitter::default();
    let control = TransferControl::default();
    control.pause();
    let task = {
        let downloader = downloader(cache.path(), &emitter);
        let link = link(&server, 2);
        let control = control.clone();
        let progress = progress(&emitter);
        tokio::spawn(async move { downloader.execute(&link, HASH, &control, &progress).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    control.stop();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(DownloadError::Stopped)));
    assert!(!cache.path().join(format!("{HASH}.bin")).exists());
    assert_eq!(std::fs::metadata(&part0).unwrap().len(), 250);
}

#[tokio::test]
async fn test_failed_segment_keeps_completed_parts() {
    let server = require_mock_server!();
    let body = payload(1_000);
    serve(
        &server,
        RangeResponder::new(body.clone()).failing_at(500, Duration::from_millis(300)),
    )
    .await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let result = downloader(cache.path(), &emitter)
        .execute(&link(&server, 2), HASH, &TransferControl::default(), &progress(&emitter))
        .await;

    match result {
        Err(DownloadError::SegmentFailed { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected SegmentFailed, got {other:?}"),
    }
    let part0 = cache.path().join(part_file_name(HASH, 0));
    assert_eq!(std::fs::read(part0).unwrap(), &body[..500]);
    assert!(!cache.path().join(format!("{HASH}.bin")).exists());
}

#[tokio::test]
async fn test_host_without_ranges_uses_single_stream() {
    let server = require_mock_server!();
    let body = payload(3_333);
    serve(&server, RangeResponder::new(body.clone()).without_ranges()).await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let artifact = downloader(cache.path(), &emitter)
        .execute(&link(&server, 8), HASH, &TransferControl::default(), &progress(&emitter))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&artifact.path).unwrap(), body);
    let requests = server.received_requests().await.unwrap();
    // Probe plus one unranged transfer.
    assert_eq!(requests.len(), 2);
    assert!(requests[1].headers.get("range").is_none());
    assert!(!cache.path().join(part_file_name(HASH, 1)).exists());
}

#[tokio::test]
async fn test_cached_artifact_is_reused() {
    let server = require_mock_server!();
    let body = payload(1_234);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    std::fs::write(cache.path().join(format!("{HASH}.bin")), &body).unwrap();

    let emitter = EventEmitter::default();
    let progress = progress(&emitter);
    let artifact = downloader(cache.path(), &emitter)
        .execute(&link(&server, 4), HASH, &TransferControl::default(), &progress)
        .await
        .unwrap();

    assert_eq!(artifact.size, 1_234);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(progress.snapshot().percent(), 100);
}

/// Leaves a partial file behind and fails, like a crashed helper.
struct BrokenAccelerator {
    calls: AtomicUsize,
}

#[async_trait]
impl ExternalAccelerator for BrokenAccelerator {
    fn name(&self) -> &str {
        "broken"
    }

    async fn fetch(
        &self,
        job: AcceleratorJob<'_>,
        _control: &TransferControl,
        progress: &TransferProgress,
    ) -> Result<(), DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(job.output_dir.join(job.file_name), b"garbage").unwrap();
        std::fs::write(job.output_dir.join(format!("{}.aria2", job.file_name)), b"ctl").unwrap();
        progress.record_percent(40);
        Err(DownloadError::Accelerator {
            program: "broken".into(),
            detail: "exit status 3".into(),
        })
    }
}

#[tokio::test]
async fn test_accelerator_failure_falls_back_to_segments() {
    let server = require_mock_server!();
    let body = payload(5_000);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let accelerator = Arc::new(BrokenAccelerator {
        calls: AtomicUsize::new(0),
    });
    let artifact = downloader(cache.path(), &emitter)
        .with_accelerator(Arc::clone(&accelerator) as Arc<dyn ExternalAccelerator>)
        .execute(&link(&server, 4), HASH, &TransferControl::default(), &progress(&emitter))
        .await
        .unwrap();

    assert_eq!(accelerator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&artifact.path).unwrap(), body);
    assert!(!cache.path().join(format!("{HASH}.bin.aria2")).exists());
}

#[tokio::test]
async fn test_accelerator_skipped_for_links_with_session_state() {
    let server = require_mock_server!();
    let body = payload(800);
    serve(&server, RangeResponder::new(body.clone())).await;

    let cache = TempDir::new().unwrap();
    let emitter = EventEmitter::default();
    let accelerator = Arc::new(BrokenAccelerator {
        calls: AtomicUsize::new(0),
    });
    let link = link(&server, 2).with_header("Cookie", "session=abc");
    downloader(cache.path(), &emitter)
        .with_accelerator(Arc::clone(&accelerator) as Arc<dyn ExternalAccelerator>)
        .execute(&link, HASH, &TransferControl::default(), &progress(&emitter))
        .await
        .unwrap();

    assert_eq!(accelerator.calls.load(Ordering::SeqCst), 0);
}
