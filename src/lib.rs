//! Vaultdl Core Library
//!
//! Queue-driven downloader for content hosted on third-party file hosts.
//! A content page URL is resolved into candidate provider links, the best
//! provider is negotiated down to a direct link, the file is fetched with
//! parallel resumable range requests, and the result is unpacked into a
//! local library.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`provider`] - Provider registry, link selection, and per-host extractors
//! - [`browser`] - Page rendering capability and its serialized queue
//! - [`site`] - Content page parsing into provider candidates
//! - [`download`] - Segmented, resumable, rate-limited transfer engine
//! - [`finalize`] - Archive extraction and library registration
//! - [`queue`] - Persisted queue items and store
//! - [`manager`] - Single-flight queue coordinator
//! - [`events`] - Notifications for observers
//! - [`config`] - TOML configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod browser;
pub mod config;
pub mod download;
pub mod events;
pub mod finalize;
pub mod manager;
pub mod provider;
pub mod queue;
pub mod site;
mod user_agent;

// Re-export commonly used types
pub use config::{AppConfig, load_config};
pub use download::{DownloadClient, DownloadError, SegmentedDownloader, TransferControl};
pub use events::{DownloadEvent, EventEmitter, EventKind};
pub use finalize::{Finalizer, JsonLibrary};
pub use manager::{DownloadQueueManager, EnqueueResult, ManagerError, ManagerParts, ManagerStatus};
pub use provider::{ProviderRegistry, ResolvedLink};
pub use queue::{QueueError, QueueItem, QueueStatus, QueueStore};
pub use site::{SiteDescriptor, SiteResolver};
