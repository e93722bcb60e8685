//! Application configuration loaded from a TOML file.
//!
//! Missing files yield defaults. Values present in the file are validated
//! before use; command-line flags are applied on top by the binary.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

const APP_DIR_NAME: &str = "vaultdl";
const DEFAULT_RESOLVER_TIMEOUT_SECS: u64 = 30;

/// Per-provider adjustments applied once before the registry is frozen.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderOverride {
    pub enabled: Option<bool>,
    pub priority: Option<u32>,
    pub worker_count: Option<usize>,
    pub inter_worker_delay_secs: Option<f64>,
}

impl ProviderOverride {
    /// Returns the override delay as a [`Duration`], if set.
    #[must_use]
    pub fn inter_worker_delay(&self) -> Option<Duration> {
        self.inter_worker_delay_secs.map(Duration::from_secs_f64)
    }
}

/// TOML-backed application configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Final library location for finalized items.
    pub download_dir: PathBuf,
    /// Part files and merged artifacts.
    pub cache_dir: PathBuf,
    /// Persisted queue; defaults under the state directory.
    pub queue_file: Option<PathBuf>,
    /// Library records; defaults under the state directory.
    pub library_file: Option<PathBuf>,
    /// Global speed cap in KiB/s, `0` for unlimited.
    pub speed_limit_kib: u64,
    pub speed_limit_enabled: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub resolver_timeout_secs: u64,
    pub accelerator_path: Option<PathBuf>,
    pub use_accelerator: bool,
    pub extractor_path: Option<PathBuf>,
    /// Top-level archive folders never treated as the content folder.
    pub non_content_dirs: Vec<String>,
    pub debrid_api_key: Option<String>,
    pub providers: BTreeMap<String, ProviderOverride>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("Downloads"),
            cache_dir: PathBuf::from("DownloadCache"),
            queue_file: None,
            library_file: None,
            speed_limit_kib: 0,
            speed_limit_enabled: false,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            resolver_timeout_secs: DEFAULT_RESOLVER_TIMEOUT_SECS,
            accelerator_path: None,
            use_accelerator: true,
            extractor_path: None,
            non_content_dirs: vec!["_CommonRedist".to_string(), "__MACOSX".to_string()],
            debrid_api_key: None,
            providers: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Validates values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        validate_timeout_secs("resolver_timeout_secs", self.resolver_timeout_secs)?;

        for (key, provider) in &self.providers {
            if let Some(workers) = provider.worker_count
                && workers > 64
            {
                bail!(
                    "Invalid config value for `providers.{key}.worker_count`: {workers}. Expected range: 0..=64"
                );
            }
            if let Some(delay) = provider.inter_worker_delay_secs
                && !(0.0..=60.0).contains(&delay)
            {
                bail!(
                    "Invalid config value for `providers.{key}.inter_worker_delay_secs`: {delay}. Expected range: 0..=60"
                );
            }
        }

        if self.debrid_api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            bail!("Invalid config value for `debrid_api_key`: must not be blank");
        }
        Ok(())
    }

    /// Effective speed cap in bytes per second.
    #[must_use]
    pub fn speed_limit_bytes(&self) -> Option<u64> {
        (self.speed_limit_enabled && self.speed_limit_kib > 0)
            .then(|| self.speed_limit_kib.saturating_mul(1024))
    }

    /// Queue file path, falling back to the state directory.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.queue_file
            .clone()
            .unwrap_or_else(|| resolve_state_dir().join("downloads.json"))
    }

    /// Library records path, falling back to the state directory.
    #[must_use]
    pub fn library_path(&self) -> PathBuf {
        self.library_file
            .clone()
            .unwrap_or_else(|| resolve_state_dir().join("library.json"))
    }
}

fn validate_timeout_secs(field: &str, value: u64) -> Result<()> {
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/vaultdl/config.toml`
/// 2. `$HOME/.config/vaultdl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join(APP_DIR_NAME)
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR_NAME)
            .join("config.toml"),
    )
}

/// State directory for the queue and library files.
///
/// `$XDG_STATE_HOME/vaultdl`, then `$HOME/.local/state/vaultdl`, then `.vaultdl`.
#[must_use]
pub fn resolve_state_dir() -> PathBuf {
    if let Some(state_home) = env_var_non_empty_os("XDG_STATE_HOME") {
        return PathBuf::from(state_home).join(APP_DIR_NAME);
    }
    env_var_non_empty_os("HOME").map_or_else(
        || PathBuf::from(".vaultdl"),
        |home| {
            PathBuf::from(home)
                .join(".local")
                .join("state")
                .join(APP_DIR_NAME)
        },
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from `explicit` or the default path.
///
/// An explicit path must exist; a missing default file yields defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            path.to_path_buf()
        }
        None => match resolve_default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(AppConfig::default()),
        },
    };
    load_config_file(&path)
}

/// Parses and validates a single config file.
pub fn load_config_file(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}
