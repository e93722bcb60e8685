//! Delegation to an external multi-connection downloader.
//!
//! Only links that need nothing beyond their URL are handed off; anything
//! carrying headers, a payload, or a session stays on the internal path.
//! The external tool has no pause; stop kills the process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::constants::ACCELERATOR_MIN_CONNECTIONS;
use super::control::TransferControl;
use super::error::DownloadError;
use super::progress::TransferProgress;
use crate::provider::html::compile_static_regex;

const ARIA2_PROGRAM: &str = "aria2c";

static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"\((\d{1,3})%\)"));

/// What the accelerator should fetch and where to put it.
#[derive(Debug, Clone)]
pub struct AcceleratorJob<'a> {
    pub url: &'a str,
    pub output_dir: &'a Path,
    pub file_name: &'a str,
    pub connections: usize,
    /// Aggregate cap in bytes per second.
    pub speed_limit: Option<u64>,
}

/// An external process that downloads a plain URL to a file.
#[async_trait]
pub trait ExternalAccelerator: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the job to completion, reporting percent through `progress`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Stopped`] when `control` is stopped and
    /// [`DownloadError::Accelerator`] for launch failures or a non-zero exit.
    async fn fetch(
        &self,
        job: AcceleratorJob<'_>,
        control: &TransferControl,
        progress: &TransferProgress,
    ) -> Result<(), DownloadError>;
}

/// aria2 driven through its console output.
#[derive(Debug, Clone)]
pub struct Aria2Accelerator {
    program: PathBuf,
}

impl Aria2Accelerator {
    /// Uses `configured` if it exists, else looks for `aria2c` on `PATH`.
    #[must_use]
    pub fn locate(configured: Option<&Path>) -> Option<Self> {
        if let Some(path) = configured {
            if path.is_file() {
                return Some(Self {
                    program: path.to_path_buf(),
                });
            }
            warn!(path = %path.display(), "configured accelerator not found; searching PATH");
        }
        which::which(ARIA2_PROGRAM)
            .ok()
            .map(|program| Self { program })
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn error(&self, detail: impl Into<String>) -> DownloadError {
        DownloadError::Accelerator {
            program: self.program.display().to_string(),
            detail: detail.into(),
        }
    }
}

/// Command-line arguments for one aria2 job.
#[must_use]
pub fn aria2_args(job: &AcceleratorJob<'_>) -> Vec<String> {
    let connections = job.connections.max(ACCELERATOR_MIN_CONNECTIONS).min(16);
    let mut args = vec![
        job.url.to_string(),
        "-d".to_string(),
        job.output_dir.display().to_string(),
        "-o".to_string(),
        job.file_name.to_string(),
        format!("-x{connections}"),
        format!("-s{connections}"),
        "--file-allocation=none".to_string(),
        "--summary-interval=1".to_string(),
        "--console-log-level=warn".to_string(),
        "--allow-overwrite=true".to_string(),
    ];
    if let Some(limit) = job.speed_limit.filter(|l| *l > 0) {
        args.push(format!("--max-overall-download-limit={}K", (limit / 1024).max(1)));
    }
    args
}

/// Percent from an aria2 readout such as `[#2089b0 400KiB/33MiB(1%) CN:1 DL:115KiB]`.
#[must_use]
pub fn parse_aria2_percent(line: &str) -> Option<u8> {
    if !line.contains("CN:") {
        return None;
    }
    PERCENT_RE
        .captures(line)
        .and_then(|caps| caps.get(1)?.as_str().parse::<u8>().ok())
        .map(|p| p.min(100))
}

#[async_trait]
impl ExternalAccelerator for Aria2Accelerator {
    fn name(&self) -> &str {
        ARIA2_PROGRAM
    }

    #[instrument(skip(self, job, control, progress), fields(file = %job.file_name))]
    async fn fetch(
        &self,
        job: AcceleratorJob<'_>,
        control: &TransferControl,
        progress: &TransferProgress,
    ) -> Result<(), DownloadError> {
        let args = aria2_args(&job);
        info!(connections = job.connections, "delegating transfer to aria2");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(format!("launch failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.error("stdout not captured"))?;
        let mut stderr = child.stderr.take();
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                () = control.cancellation().cancelled() => {
                    debug!("stop requested; killing accelerator");
                    if let Err(error) = child.kill().await {
                        warn!(error = %error, "failed to kill accelerator");
                    }
                    return Err(DownloadError::Stopped);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(percent) = parse_aria2_percent(&line) {
                            progress.record_percent(percent);
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(error = %error, "unreadable accelerator output");
                        break;
                    }
                },
            }
        }

        let status = tokio::select! {
            () = control.cancellation().cancelled() => {
                let _ = child.kill().await;
                return Err(DownloadError::Stopped);
            }
            status = child.wait() => status.map_err(|e| self.error(format!("wait failed: {e}")))?,
        };
        if status.success() {
            progress.record_percent(100);
            return Ok(());
        }

        let mut detail = String::new();
        if let Some(stderr) = stderr.as_mut() {
            let _ = stderr.read_to_string(&mut detail).await;
        }
        let detail = detail.trim();
        Err(self.error(format!(
            "exit {}{}{}",
            status.code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
            if detail.is_empty() { "" } else { ": " },
            detail
        )))
    }
}
