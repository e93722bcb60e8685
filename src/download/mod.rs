//! Segmented download engine.
//!
//! Turns a [`ResolvedLink`](crate::provider::ResolvedLink) into a complete
//! artifact in the cache directory.
//!
//! # Features
//!
//! - Parallel byte-range workers with staggered starts
//! - Per-part resume across process restarts
//! - Pause, resume, and stop through a shared [`TransferControl`]
//! - Global speed cap split across workers, adjustable mid-flight
//! - Optional delegation to an external accelerator for plain links

mod accelerator;
mod client;
pub mod constants;
mod control;
mod engine;
mod error;
mod progress;
mod segment;
mod throttle;

pub use accelerator::{
    AcceleratorJob, Aria2Accelerator, ExternalAccelerator, aria2_args, parse_aria2_percent,
};
pub use client::{DownloadClient, ProbeOutcome};
pub use control::TransferControl;
pub use engine::{Artifact, SegmentedDownloader, merge_parts};
pub use error::DownloadError;
pub use progress::{ProgressSnapshot, TransferProgress};
pub use segment::{
    SegmentState, artifact_file_name, part_file_name, partition, plan_segments,
};
pub use throttle::{SpeedPacer, pacing_delay, per_worker_quota};
