//! Byte-range partitioning and on-disk part-file state.
//!
//! Part files are named `{hash}_part_{index}` so a restarted process finds
//! them again and resumes each one from its current size. A small plan file
//! (`{hash}_plan.json`) records the ranges the parts were cut for; if a later
//! attempt partitions differently the old parts are discarded rather than
//! spliced into the wrong offsets.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::DownloadError;

/// One worker's share of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentState {
    pub index: usize,
    /// First byte offset, inclusive.
    pub byte_start: u64,
    /// Last byte offset, inclusive.
    pub byte_end: u64,
    pub part_file_path: PathBuf,
    /// Bytes already present in the part file.
    pub bytes_written: u64,
}

impl SegmentState {
    /// Bytes this segment covers.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.byte_end + 1).saturating_sub(self.byte_start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.byte_end < self.byte_start
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.len()
    }

    /// Absolute offset the next request starts at.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.byte_start + self.bytes_written
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.bytes_written)
    }

    /// `Range` header value for the outstanding bytes.
    #[must_use]
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.resume_offset(), self.byte_end)
    }
}

/// Splits `[0, total_size)` into `workers` contiguous inclusive ranges.
///
/// Every range but the last is `total_size / workers` long; the last absorbs
/// the remainder. `workers` is clamped to `1..=total_size`. An empty file
/// has no ranges.
#[must_use]
pub fn partition(total_size: u64, workers: usize) -> Vec<(u64, u64)> {
    if total_size == 0 {
        return Vec::new();
    }
    let workers = u64::try_from(workers.max(1)).unwrap_or(u64::MAX).min(total_size);
    let part = total_size / workers;
    (0..workers)
        .map(|i| {
            let start = i * part;
            let end = if i == workers - 1 {
                total_size - 1
            } else {
                start + part - 1
            };
            (start, end)
        })
        .collect()
}

#[must_use]
pub fn part_file_name(hash: &str, index: usize) -> String {
    format!("{hash}_part_{index}")
}

#[must_use]
pub fn artifact_file_name(hash: &str, extension: &str) -> String {
    if extension.is_empty() {
        hash.to_string()
    } else {
        format!("{hash}.{extension}")
    }
}

fn plan_file_name(hash: &str) -> String {
    format!("{hash}_plan.json")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SegmentPlan {
    total_size: u64,
    ranges: Vec<(u64, u64)>,
}

/// Builds segment state for a transfer, resuming from existing part files.
///
/// Parts longer than their range are truncated back to it.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] when part files cannot be inspected or the
/// plan cannot be written.
pub async fn plan_segments(
    cache_dir: &Path,
    hash: &str,
    total_size: u64,
    workers: usize,
) -> Result<Vec<SegmentState>, DownloadError> {
    let ranges = partition(total_size, workers);
    let plan = SegmentPlan {
        total_size,
        ranges: ranges.clone(),
    };
    let plan_path = cache_dir.join(plan_file_name(hash));

    if let Some(previous) = read_plan(&plan_path).await
        && previous != plan
    {
        info!(
            old_segments = previous.ranges.len(),
            new_segments = plan.ranges.len(),
            "partition changed; discarding stale parts"
        );
        discard_parts(cache_dir, hash, previous.ranges.len()).await?;
    }
    write_plan(&plan_path, &plan).await?;

    let mut segments = Vec::with_capacity(ranges.len());
    for (index, (byte_start, byte_end)) in ranges.into_iter().enumerate() {
        let part_file_path = cache_dir.join(part_file_name(hash, index));
        let target = byte_end - byte_start + 1;
        let mut existing = existing_len(&part_file_path).await?;
        if existing > target {
            warn!(index, existing, target, "part file overshoots its range; truncating");
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&part_file_path)
                .await
                .map_err(|e| DownloadError::io(&part_file_path, e))?;
            file.set_len(target)
                .await
                .map_err(|e| DownloadError::io(&part_file_path, e))?;
            existing = target;
        }
        if existing > 0 {
            debug!(index, existing, target, "resuming part");
        }
        segments.push(SegmentState {
            index,
            byte_start,
            byte_end,
            part_file_path,
            bytes_written: existing,
        });
    }
    Ok(segments)
}

/// Removes the plan file once the parts have been merged.
pub(crate) async fn clear_plan(cache_dir: &Path, hash: &str) {
    let path = cache_dir.join(plan_file_name(hash));
    if let Err(error) = tokio::fs::remove_file(&path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %error, "could not remove segment plan");
    }
}

async fn existing_len(path: &Path) -> Result<u64, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

async fn read_plan(path: &Path) -> Option<SegmentPlan> {
    let raw = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&raw)
        .inspect_err(|error| warn!(error = %error, "unreadable segment plan ignored"))
        .ok()
}

async fn write_plan(path: &Path, plan: &SegmentPlan) -> Result<(), DownloadError> {
    let json = serde_json::to_vec(plan).map_err(|e| DownloadError::io(path, e.into()))?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

async fn discard_parts(cache_dir: &Path, hash: &str, count: usize) -> Result<(), DownloadError> {
    for index in 0..count {
        let path = cache_dir.join(part_file_name(hash, index));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DownloadError::io(path, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_example() {
        assert_eq!(partition(100, 3), vec![(0, 32), (33, 65), (66, 99)]);
    }

    #[test]
    fn test_partition_is_exhaustive_and_disjoint() {
        for total in [1_u64, 2, 7, 100, 1023, 1024, 65_537] {
            for workers in [0_usize, 1, 2, 3, 5, 12, 25, 2000] {
                let ranges = partition(total, workers);
                assert!(!ranges.is_empty());
                assert_eq!(ranges[0].0, 0, "total={total} workers={workers}");
                assert_eq!(ranges.last().unwrap().1, total - 1);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].1 + 1, pair[1].0, "gap or overlap at {pair:?}");
                }
                let covered: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
                assert_eq!(covered, total);
            }
        }
    }

    #[test]
    fn test_partition_clamps_workers_to_size() {
        assert_eq!(partition(3, 25).len(), 3);
        assert!(partition(0, 4).is_empty());
    }

    #[test]
    fn test_segment_range_header_uses_existing_bytes() {
        let segment = SegmentState {
            index: 1,
            byte_start: 33,
            byte_end: 65,
            part_file_path: PathBuf::from("x"),
            bytes_written: 10,
        };
        assert_eq!(segment.range_header(), "bytes=43-65");
        assert_eq!(segment.remaining(), 23);
        assert!(!segment.is_complete());
    }

    #[test]
    fn test_inverted_range_is_empty_not_underflow() {
        let mut segment = SegmentState {
            index: 0,
            byte_start: 0,
            byte_end: 0,
            part_file_path: PathBuf::from("x"),
            bytes_written: 0,
        };
        assert_eq!(segment.len(), 1);
        assert!(!segment.is_empty());

        segment.byte_start = 5;
        segment.byte_end = 3;
        assert!(segment.is_empty());
        assert_eq!(segment.len(), 0);
        assert!(segment.is_complete());
    }

    #[tokio::test]
    async fn test_plan_resumes_and_truncates_parts() {
        let dir = tempfile::tempdir().unwrap();
        let hash = "abc";
        plan_segments(dir.path(), hash, 100, 3).await.unwrap();
        tokio::fs::write(dir.path().join(part_file_name(hash, 0)), vec![1_u8; 10]).await.unwrap();
        tokio::fs::write(dir.path().join(part_file_name(hash, 2)), vec![2_u8; 50]).await.unwrap();

        let segments = plan_segments(dir.path(), hash, 100, 3).await.unwrap();
        assert_eq!(segments[0].bytes_written, 10);
        assert_eq!(segments[0].range_header(), "bytes=10-32");
        assert_eq!(segments[1].bytes_written, 0);
        assert_eq!(segments[2].bytes_written, 34);
        assert!(segments[2].is_complete());
        let truncated = tokio::fs::metadata(&segments[2].part_file_path).await.unwrap().len();
        assert_eq!(truncated, 34);
    }

    #[tokio::test]
    async fn test_changed_partition_discards_stale_parts() {
        let dir = tempfile::tempdir().unwrap();
        let hash = "def";
        plan_segments(dir.path(), hash, 100, 2).await.unwrap();
        tokio::fs::write(dir.path().join(part_file_name(hash, 1)), vec![0_u8; 20]).await.unwrap();

        let segments = plan_segments(dir.path(), hash, 100, 4).await.unwrap();
        assert!(segments.iter().all(|s| s.bytes_written == 0));
        assert!(!dir.path().join(part_file_name(hash, 1)).exists());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(part_file_name("h", 7), "h_part_7");
        assert_eq!(artifact_file_name("h", "rar"), "h.rar");
        assert_eq!(artifact_file_name("h", ""), "h");
    }
}
