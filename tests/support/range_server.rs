//! Mock host that serves a fixed body with HTTP range support.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-looking body of `len` bytes.
#[must_use]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + i / 251) % 251).unwrap_or(0))
        .collect()
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Parses `bytes=start-end` (end optional).
#[must_use]
pub fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim();
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

/// All `Range` headers the server saw, in arrival order.
#[must_use]
pub fn range_headers(requests: &[Request]) -> Vec<String> {
    requests
        .iter()
        .filter_map(|r| r.headers.get("range"))
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Answers ranged requests with `206` slices of `body` and plain requests
/// with the whole body.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    /// Range starts answered with `500` after `fail_delay`.
    failing_starts: HashSet<u64>,
    fail_delay: Duration,
    /// When false, `Range` is ignored and every answer is a plain `200`.
    honor_ranges: bool,
    /// Added to every answer.
    delay: Duration,
}

impl RangeResponder {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            failing_starts: HashSet::new(),
            fail_delay: Duration::ZERO,
            honor_ranges: true,
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn failing_at(mut self, start: u64, delay: Duration) -> Self {
        self.failing_starts.insert(start);
        self.fail_delay = delay;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn without_ranges(mut self) -> Self {
        self.honor_ranges = false;
        self
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let (template, extra) = self.answer(request);
        template.set_delay(self.delay + extra)
    }
}

impl RangeResponder {
    fn answer(&self, request: &Request) -> (ResponseTemplate, Duration) {
        let len = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
            .filter(|_| self.honor_ranges);

        let Some((start, end)) = range else {
            return (
                ResponseTemplate::new(200).set_body_bytes(self.body.to_vec()),
                Duration::ZERO,
            );
        };
        if start > 0 && self.failing_starts.contains(&start) {
            return (ResponseTemplate::new(500), self.fail_delay);
        }
        if start >= len {
            return (
                ResponseTemplate::new(416).insert_header("content-range", format!("bytes */{len}")),
                Duration::ZERO,
            );
        }
        let end = end.unwrap_or(len - 1).min(len - 1);
        let slice = self.body[usize::try_from(start).unwrap_or(0)..=usize::try_from(end).unwrap_or(0)]
            .to_vec();
        let template = ResponseTemplate::new(206)
            .insert_header("content-range", format!("bytes {start}-{end}/{len}"))
            .set_body_bytes(slice);
        (template, Duration::ZERO)
    }
}
