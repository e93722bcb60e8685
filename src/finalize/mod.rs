//! Post-download finalize step: unpack or move the artifact into the
//! library directory and register it.
//!
//! Archives are unpacked into `{target}/.staging_{hash}`. The first
//! top-level directory that is not on the non-content list is taken as the
//! real content and promoted to `{target}/{hash}`; when there is none, the
//! staging directory itself is promoted. This is a best-effort heuristic and
//! can pick the wrong folder in archives with several top-level folders.
//! A failed extraction leaves the staging directory in place for
//! inspection. Other files are moved to `{target}/{hash}.{ext}`.

mod extractor;
mod library;

pub use extractor::{ArchiveExtractor, CommandExtractor, ExtractionOutcome, last_percent};
pub use library::{JsonLibrary, LibraryRecord, LibraryStore, find_executable};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::download::Artifact;
use crate::events::EventEmitter;

/// Extensions treated as archives.
const ARCHIVE_EXTENSIONS: [&str; 3] = ["rar", "zip", "7z"];

/// Errors that can occur while finalizing an artifact.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The extractor exited unsuccessfully; the staging directory is kept.
    #[error(
        "extracting {archive} failed (exit {}): {stderr}\n  Suggestion: Inspect {staging} and re-download if the archive is damaged",
        .exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
    )]
    ArchiveCorrupt {
        archive: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
        staging: PathBuf,
    },

    /// No configured or installed tool handles this archive type.
    #[error(
        "no extractor available for .{extension} archives\n  Suggestion: Install unrar or 7-Zip, or set extractor_path in the config"
    )]
    ExtractorMissing { extension: String },

    /// The extractor could not be started or awaited.
    #[error("could not run extractor {program}: {source}")]
    ExtractorLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The library file could not be updated.
    #[error("library update failed at {path}: {reason}")]
    Library { path: PathBuf, reason: String },
}

impl FinalizeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn library(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Library {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Identity of the item being finalized.
#[derive(Debug, Clone, Copy)]
pub struct FinalizeRequest<'a> {
    pub hash: &'a str,
    pub alias: &'a str,
    pub content_url: &'a str,
    pub artifact: &'a Artifact,
}

/// Moves finished artifacts into the library directory.
pub struct Finalizer {
    target_dir: PathBuf,
    extractor: Option<Arc<dyn ArchiveExtractor>>,
    library: Arc<dyn LibraryStore>,
    non_content_dirs: Vec<String>,
    emitter: EventEmitter,
}

impl Finalizer {
    #[must_use]
    pub fn new(
        target_dir: impl Into<PathBuf>,
        extractor: Option<Arc<dyn ArchiveExtractor>>,
        library: Arc<dyn LibraryStore>,
        non_content_dirs: Vec<String>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            target_dir: target_dir.into(),
            extractor,
            library,
            non_content_dirs,
            emitter,
        }
    }

    #[must_use]
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Finalizes the artifact and returns its location in the library.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizeError`] for extraction, move, or library failures.
    #[instrument(skip(self, request), fields(hash = %request.hash))]
    pub async fn finalize(&self, request: FinalizeRequest<'_>) -> Result<PathBuf, FinalizeError> {
        tokio::fs::create_dir_all(&self.target_dir)
            .await
            .map_err(|e| FinalizeError::io(&self.target_dir, e))?;

        let extension = request.artifact.file_extension.to_ascii_lowercase();
        if ARCHIVE_EXTENSIONS.contains(&extension.as_str()) {
            let extractor = self
                .extractor
                .as_ref()
                .filter(|x| x.supports(&extension))
                .ok_or_else(|| FinalizeError::ExtractorMissing {
                    extension: extension.clone(),
                })?;
            self.unpack(extractor.as_ref(), request).await
        } else {
            self.place_file(request).await
        }
    }

    async fn unpack(
        &self,
        extractor: &dyn ArchiveExtractor,
        request: FinalizeRequest<'_>,
    ) -> Result<PathBuf, FinalizeError> {
        let archive = &request.artifact.path;
        let staging = self.target_dir.join(format!(".staging_{}", request.hash));
        remove_dir_if_present(&staging).await?;
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| FinalizeError::io(&staging, e))?;

        self.emitter
            .status(request.hash, format!("Unpacking with {}", extractor.name()));
        let emitter = self.emitter.clone();
        let hash = request.hash.to_string();
        let outcome = extractor
            .extract(archive, &staging, &move |percent: u8| emitter.progress(&hash, percent))
            .await?;
        if !outcome.succeeded() {
            return Err(FinalizeError::ArchiveCorrupt {
                archive: archive.clone(),
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
                staging,
            });
        }

        self.emitter.status(request.hash, "Updating library");
        let content = content_folder(&staging, &self.non_content_dirs).await?;
        let final_dir = self.target_dir.join(request.hash);
        remove_dir_if_present(&final_dir).await?;
        match content {
            Some(folder) => {
                tokio::fs::rename(&folder, &final_dir)
                    .await
                    .map_err(|e| FinalizeError::io(&folder, e))?;
                remove_dir_if_present(&staging).await?;
            }
            None => {
                tokio::fs::rename(&staging, &final_dir)
                    .await
                    .map_err(|e| FinalizeError::io(&staging, e))?;
            }
        }

        let library = Arc::clone(&self.library);
        let dir = final_dir.clone();
        let (record_hash, alias, link) = (
            request.hash.to_string(),
            request.alias.to_string(),
            request.content_url.to_string(),
        );
        // Directory walk and library rewrite are blocking disk work.
        tokio::task::spawn_blocking(move || {
            let exe = find_executable(&dir);
            library.register(&record_hash, LibraryRecord::new(&alias, &link, exe.as_deref()))
        })
        .await
        .map_err(|e| FinalizeError::library(&final_dir, e.to_string()))??;

        if let Err(error) = tokio::fs::remove_file(archive).await {
            warn!(path = %archive.display(), error = %error, "could not delete unpacked archive");
        }
        info!(path = %final_dir.display(), "unpacked into library");
        Ok(final_dir)
    }

    async fn place_file(&self, request: FinalizeRequest<'_>) -> Result<PathBuf, FinalizeError> {
        let source = &request.artifact.path;
        let file_name = source
            .file_name()
            .map_or_else(|| request.hash.into(), std::ffi::OsStr::to_os_string);
        let dest = self.target_dir.join(file_name);
        self.emitter.status(request.hash, "Moving to library");
        move_file(source, &dest).await?;
        info!(path = %dest.display(), "moved into library");
        Ok(dest)
    }
}

/// First top-level directory of `staging` not named in `excluded`
/// (case-insensitive), in name order.
async fn content_folder(
    staging: &Path,
    excluded: &[String],
) -> Result<Option<PathBuf>, FinalizeError> {
    let mut entries = tokio::fs::read_dir(staging)
        .await
        .map_err(|e| FinalizeError::io(staging, e))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FinalizeError::io(staging, e))?
    {
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        let name = entry.file_name().to_string_lossy().to_string();
        if is_dir && !excluded.iter().any(|x| x.eq_ignore_ascii_case(&name)) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs.into_iter().next())
}

async fn remove_dir_if_present(path: &Path) -> Result<(), FinalizeError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FinalizeError::io(path, e)),
    }
}

/// Rename, falling back to copy-then-delete across filesystems.
async fn move_file(source: &Path, dest: &Path) -> Result<(), FinalizeError> {
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, dest)
        .await
        .map_err(|e| FinalizeError::io(dest, e))?;
    tokio::fs::remove_file(source)
        .await
        .map_err(|e| FinalizeError::io(source, e))
}
