//! Library records for finalized items.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::FinalizeError;
use crate::queue::write_json_atomic;

/// Depth below the content folder searched for an executable.
const EXE_SEARCH_DEPTH: usize = 2;

/// One installed item, keyed by content hash in the library file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub name: String,
    pub alias: String,
    pub link: String,
    /// Main executable, empty when none was found.
    #[serde(default)]
    pub exe: String,
    #[serde(default)]
    pub playtime: u64,
    /// Stored under the key existing library files already use.
    #[serde(default, rename = "categorys", alias = "categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub installed: bool,
}

fn default_version() -> String {
    "Latest".to_string()
}

impl LibraryRecord {
    #[must_use]
    pub fn new(alias: &str, link: &str, exe: Option<&Path>) -> Self {
        Self {
            name: alias.to_string(),
            alias: alias.to_string(),
            link: link.to_string(),
            exe: exe.map(|p| p.display().to_string()).unwrap_or_default(),
            playtime: 0,
            categories: Vec::new(),
            version: default_version(),
            installed: true,
        }
    }
}

/// Where finalized items are registered.
pub trait LibraryStore: Send + Sync {
    /// Inserts `record`, or refreshes `exe` and `installed` on an existing
    /// entry so user edits (name, playtime, categories) survive a reinstall.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizeError::Library`] when the store cannot be updated.
    fn register(&self, hash: &str, record: LibraryRecord) -> Result<(), FinalizeError>;
}

/// Library kept as a JSON object `{hash: record}`.
#[derive(Debug)]
pub struct JsonLibrary {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLibrary {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records; a missing file is an empty library.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizeError::Library`] when the file cannot be read or parsed.
    pub fn load(&self) -> Result<BTreeMap<String, LibraryRecord>, FinalizeError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(FinalizeError::library(&self.path, e.to_string())),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&raw).map_err(|e| FinalizeError::library(&self.path, e.to_string()))
    }
}

impl LibraryStore for JsonLibrary {
    fn register(&self, hash: &str, record: LibraryRecord) -> Result<(), FinalizeError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| FinalizeError::library(&self.path, e.to_string()))?;
        }
        let mut records = self.load()?;
        match records.get_mut(hash) {
            Some(existing) => {
                debug!(hash, "refreshing existing library record");
                existing.exe = record.exe;
                existing.installed = true;
            }
            None => {
                info!(hash, name = %record.name, "adding library record");
                records.insert(hash.to_string(), record);
            }
        }
        write_json_atomic(&self.path, &records)
            .map_err(|e| FinalizeError::library(&self.path, e.to_string()))
    }
}

/// First `.exe` under `root`, preferring the top level and skipping engine
/// helpers such as `UnityCrashHandler64.exe`.
#[must_use]
pub fn find_executable(root: &Path) -> Option<PathBuf> {
    let mut level = vec![root.to_path_buf()];
    for _ in 0..=EXE_SEARCH_DEPTH {
        let mut next = Vec::new();
        for dir in &level {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut entries: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
            entries.sort();
            for path in entries {
                if path.is_dir() {
                    next.push(path);
                } else if is_candidate_exe(&path) {
                    return Some(path);
                }
            }
        }
        level = next;
    }
    None
}

fn is_candidate_exe(path: &Path) -> bool {
    let is_exe = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    is_exe && !name.contains("unity")
}
