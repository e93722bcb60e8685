//! CLI entry point for vaultdl.

use std::collections::HashMap;
use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info, warn};
use vaultdl_core::browser::{HttpPageRenderer, PageRenderer, RenderQueue, RenderQueueConfig};
use vaultdl_core::download::{Aria2Accelerator, DownloadClient, SegmentedDownloader};
use vaultdl_core::finalize::{ArchiveExtractor, CommandExtractor, Finalizer, JsonLibrary};
use vaultdl_core::provider::{BuiltinOptions, DebridClient, ProviderRegistry};
use vaultdl_core::{
    AppConfig, DownloadQueueManager, EnqueueResult, EventEmitter, ManagerParts, QueueStatus,
    QueueStore, SiteDescriptor, SiteResolver, load_config,
};

mod cli;
mod progress_ui;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = effective_config(&args)?;
    let manager = build_manager(&config, !args.no_accelerator)?;

    if args.is_maintenance() {
        // Keep the queue from starting while state is edited.
        manager.stop().await;
    }

    if args.list {
        print_queue(&manager).await;
        return Ok(());
    }
    if let Some(hash) = args.remove.as_deref() {
        let deleted = manager.remove(hash).await?;
        println!("Removed {hash} ({deleted} cache files deleted)");
        return Ok(());
    }
    if args.wipe_cache {
        let removed = manager.wipe_cache().await?;
        println!("Deleted {removed} cache entries");
        return Ok(());
    }

    if args.retry_failed {
        for item in manager.items().await {
            if item.status.needs_attention() {
                manager.retry(&item.content_hash).await?;
            }
        }
    }

    let use_bar = !args.quiet && io::stderr().is_terminal();
    let events = manager.emitter().subscribe();
    let mut aliases: HashMap<String, String> = manager
        .items()
        .await
        .into_iter()
        .map(|item| (item.content_hash, item.display_alias))
        .collect();

    for url in &args.urls {
        match manager.enqueue(url, None, "cli").await? {
            EnqueueResult::Added(hash) => debug!(url = %url, hash = %hash, "enqueued"),
            EnqueueResult::AlreadyQueued(hash) => {
                info!(url = %url, hash = %hash, "already queued");
            }
        }
    }
    for item in manager.items().await {
        aliases.entry(item.content_hash).or_insert(item.display_alias);
    }
    if aliases.is_empty() {
        info!("Nothing queued. Pass content page or provider URLs as arguments.");
        return Ok(());
    }

    let (ui, stop_ui) = progress_ui::spawn_progress_ui(use_bar, events, aliases);
    manager.start().await;

    tokio::select! {
        () = manager.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; stopping active download (part files are kept)");
            manager.stop().await;
        }
    }
    stop_ui.cancel();
    if let Err(e) = ui.await {
        debug!(error = %e, "progress UI task ended abnormally");
    }

    let remaining = manager.items().await;
    let failed: Vec<_> = remaining
        .iter()
        .filter(|item| item.status == QueueStatus::Error)
        .collect();
    info!(remaining = remaining.len(), failed = failed.len(), "queue run finished");
    if !failed.is_empty() {
        bail!(
            "{} item(s) failed; see errors above. Retry with --retry-failed",
            failed.len()
        );
    }
    Ok(())
}

fn effective_config(args: &Args) -> Result<AppConfig> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(dir) = &args.download_dir {
        config.download_dir.clone_from(dir);
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir.clone_from(dir);
    }
    if let Some(kib) = args.speed_limit {
        config.speed_limit_kib = kib;
        config.speed_limit_enabled = kib > 0;
    }
    config.validate()?;
    Ok(config)
}

fn build_manager(config: &AppConfig, allow_accelerator: bool) -> Result<DownloadQueueManager> {
    let resolver_timeout = Duration::from_secs(config.resolver_timeout_secs);
    let emitter = EventEmitter::default();

    let debrid = match config.debrid_api_key.as_deref() {
        Some(key) => Some(
            DebridClient::new(key, resolver_timeout).context("Failed to build debrid client")?,
        ),
        None => None,
    };
    let mut registry = ProviderRegistry::builtin(&BuiltinOptions {
        request_timeout: resolver_timeout,
        debrid,
        ..BuiltinOptions::default()
    });
    registry.apply_overrides(&config.providers);
    let registry = Arc::new(registry);

    let plain: Arc<dyn PageRenderer> = Arc::new(
        HttpPageRenderer::new(resolver_timeout).context("Failed to build page fetcher")?,
    );
    let render_queue = RenderQueue::new(Arc::clone(&plain), RenderQueueConfig::default());
    render_queue.start();
    let sites = SiteResolver::new(
        SiteDescriptor::builtin(),
        Arc::clone(&registry),
        Arc::new(render_queue),
        plain,
    );

    let client = DownloadClient::with_timeouts(
        Duration::from_secs(config.connect_timeout_secs),
        Duration::from_secs(config.read_timeout_secs),
    )
    .context("Failed to build download client")?;
    let mut downloader = SegmentedDownloader::new(client, &config.cache_dir, emitter.clone());
    if allow_accelerator && config.use_accelerator {
        match Aria2Accelerator::locate(config.accelerator_path.as_deref()) {
            Some(aria2) => {
                debug!(program = %aria2.program().display(), "external accelerator available");
                downloader = downloader.with_accelerator(Arc::new(aria2));
            }
            None => debug!("no external accelerator found"),
        }
    }

    let extractor = CommandExtractor::locate(config.extractor_path.as_deref())
        .map(|x| Arc::new(x) as Arc<dyn ArchiveExtractor>);
    if extractor.is_none() {
        warn!("no unrar/7z found; archives will fail to finalize");
    }
    let finalizer = Finalizer::new(
        &config.download_dir,
        extractor,
        Arc::new(JsonLibrary::new(config.library_path())),
        config.non_content_dirs.clone(),
        emitter.clone(),
    );

    let store = QueueStore::open(config.queue_path())?;
    let manager = DownloadQueueManager::new(ManagerParts {
        store,
        sites,
        registry,
        downloader,
        finalizer,
        emitter,
        speed_limit: config.speed_limit_bytes(),
    })?;
    Ok(manager)
}

async fn print_queue(manager: &DownloadQueueManager) {
    let items = manager.items().await;
    if items.is_empty() {
        println!("Queue is empty");
        return;
    }
    for (position, item) in items.iter().enumerate() {
        println!(
            "{:>3}. [{:<11}] {}  {}  {}",
            position + 1,
            item.status,
            item.content_hash,
            item.display_alias,
            item.content_url
        );
    }
}
