//! Progress bar driven by the manager's event stream.

use std::collections::HashMap;
use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use vaultdl_core::{DownloadEvent, EventKind};

/// Spawns the progress UI when requested.
/// Returns (handle, stop) so the caller can cancel `stop` and await the handle.
/// When `use_bar` is false the events are only drained into the log.
pub(crate) fn spawn_progress_ui(
    use_bar: bool,
    events: broadcast::Receiver<DownloadEvent>,
    aliases: HashMap<String, String>,
) -> (tokio::task::JoinHandle<()>, CancellationToken) {
    let stop = CancellationToken::new();
    let bar = use_bar.then(new_bar);
    let handle = tokio::spawn(render(bar, events, aliases, stop.clone()));
    (handle, stop)
}

fn new_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {prefix:.bold} [{bar:30}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

async fn render(
    bar: Option<ProgressBar>,
    mut events: broadcast::Receiver<DownloadEvent>,
    aliases: HashMap<String, String>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress UI lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let name = aliases
            .get(&event.hash)
            .cloned()
            .unwrap_or_else(|| event.hash.chars().take(8).collect());
        let Some(bar) = bar.as_ref() else {
            log_event(&name, &event.kind);
            continue;
        };
        bar.set_prefix(name.clone());
        match event.kind {
            EventKind::Status(text) => bar.set_message(text),
            EventKind::Progress(percent) => bar.set_position(u64::from(percent)),
            EventKind::Meta {
                total_size,
                filename,
            } => {
                bar.set_position(0);
                bar.set_message(format!("{filename} ({})", HumanBytes(total_size)));
            }
            EventKind::Error(message) => bar.println(format!("✗ {name}: {message}")),
            EventKind::Complete { path } => {
                bar.set_position(100);
                bar.println(format!("✓ {name} -> {}", path.display()));
            }
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

fn log_event(name: &str, kind: &EventKind) {
    match kind {
        EventKind::Error(message) => tracing::error!(item = name, "{message}"),
        EventKind::Complete { path } => {
            tracing::info!(item = name, path = %path.display(), "complete");
        }
        EventKind::Status(text) => tracing::debug!(item = name, status = %text),
        EventKind::Progress(_) | EventKind::Meta { .. } => {}
    }
}
