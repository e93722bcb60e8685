//! Archive extraction through an external command-line tool.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::FinalizeError;
use crate::provider::html::compile_static_regex;

static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(\d{1,3})%"));

/// Exit status and diagnostics of one extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl ExtractionOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Unpacks an archive into a directory.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// True when this tool can unpack files with `extension`.
    fn supports(&self, extension: &str) -> bool;

    /// Extracts `archive` into `dest`, reporting percent through `on_progress`.
    ///
    /// A non-zero exit is returned as an outcome, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizeError::ExtractorLaunch`] when the tool cannot be run.
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<ExtractionOutcome, FinalizeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolFlavor {
    /// `unrar x -y <archive> <dest>/`
    Unrar,
    /// `7z x -y -o<dest> <archive>`
    SevenZip,
}

/// `unrar` or `7z` invoked as a child process.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    flavor: ToolFlavor,
}

impl CommandExtractor {
    /// Uses `configured` when it exists, else `unrar` or `7z` from `PATH`.
    #[must_use]
    pub fn locate(configured: Option<&Path>) -> Option<Self> {
        if let Some(path) = configured {
            if path.is_file() {
                return Some(Self::for_program(path.to_path_buf()));
            }
            warn!(path = %path.display(), "configured extractor not found; searching PATH");
        }
        ["unrar", "7z", "7zz"]
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(Self::for_program)
    }

    /// Picks argument style from the program's file name.
    #[must_use]
    pub fn for_program(program: PathBuf) -> Self {
        let stem = program
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let flavor = if stem.starts_with("7z") {
            ToolFlavor::SevenZip
        } else {
            ToolFlavor::Unrar
        };
        Self { program, flavor }
    }

    fn args(&self, archive: &Path, dest: &Path) -> Vec<String> {
        match self.flavor {
            ToolFlavor::Unrar => vec![
                "x".into(),
                "-y".into(),
                archive.display().to_string(),
                format!("{}{}", dest.display(), std::path::MAIN_SEPARATOR),
            ],
            ToolFlavor::SevenZip => vec![
                "x".into(),
                "-y".into(),
                "-bsp1".into(),
                format!("-o{}", dest.display()),
                archive.display().to_string(),
            ],
        }
    }
}

/// Last percent marker in a chunk of tool output.
#[must_use]
pub fn last_percent(output: &str) -> Option<u8> {
    PERCENT_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u8>().ok())
        .filter(|p| *p <= 100)
        .last()
}

#[async_trait]
impl ArchiveExtractor for CommandExtractor {
    fn name(&self) -> &str {
        match self.flavor {
            ToolFlavor::Unrar => "unrar",
            ToolFlavor::SevenZip => "7z",
        }
    }

    fn supports(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        match self.flavor {
            ToolFlavor::Unrar => extension == "rar",
            ToolFlavor::SevenZip => matches!(extension.as_str(), "rar" | "zip" | "7z"),
        }
    }

    #[instrument(skip(self, on_progress), fields(tool = self.name()))]
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<ExtractionOutcome, FinalizeError> {
        let mut child = Command::new(&self.program)
            .args(self.args(archive, dest))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FinalizeError::ExtractorLaunch {
                program: self.program.display().to_string(),
                source: e,
            })?;

        let mut stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut text).await;
            }
            text
        });

        // The tools redraw percentages with backspaces, so read raw chunks
        // rather than lines.
        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = vec![0_u8; 4096];
            let mut last = None;
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        if let Some(percent) = last_percent(&chunk)
                            && last != Some(percent)
                        {
                            last = Some(percent);
                            on_progress(percent);
                        }
                    }
                    Err(error) => {
                        debug!(error = %error, "extractor stdout closed");
                        break;
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FinalizeError::ExtractorLaunch {
                program: self.program.display().to_string(),
                source: e,
            })?;
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(ExtractionOutcome {
            exit_code: status.code(),
            stderr: stderr.trim().to_string(),
        })
    }
}
