//! HTTP client for direct-link transfers.
//!
//! [`DownloadClient`] speaks to the byte-serving end of a [`ResolvedLink`]:
//! it replays the link's method, headers, and form payload, probes for size
//! and range support, and opens ranged streams for segment workers.

use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::provider::{HttpMethod, ResolvedLink};
use crate::user_agent;

/// Size and range capability learned from a one-byte probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// `None` when the server announced neither `Content-Range` nor `Content-Length`.
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
}

impl ProbeOutcome {
    /// True when the file can be split across workers and resumed.
    #[must_use]
    pub fn is_segmentable(&self) -> bool {
        self.supports_ranges && self.total_size.is_some_and(|size| size > 0)
    }
}

/// Reusable client for direct-link requests.
#[derive(Debug, Clone)]
pub struct DownloadClient {
    client: Client,
}

impl DownloadClient {
    /// Builds a client with the default timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error when TLS or proxy configuration fails.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// # Errors
    ///
    /// Returns the builder error when TLS or proxy configuration fails.
    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(connect, read)?,
        })
    }

    /// Requests the first byte to learn the size and whether ranges work.
    ///
    /// # Errors
    ///
    /// Returns a host failure ([`DownloadError::is_host_failure`]) when the
    /// link is unreachable or answers with an error status.
    #[instrument(skip(self, link), fields(provider = %link.provider_key))]
    pub async fn probe(&self, link: &ResolvedLink) -> Result<ProbeOutcome, DownloadError> {
        let url = link.direct_url.as_str();
        let response = self
            .request(link)?
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| DownloadError::from_request(url, e))?;

        let status = response.status();
        let outcome = match status {
            StatusCode::PARTIAL_CONTENT => ProbeOutcome {
                total_size: content_range_total(&response),
                supports_ranges: true,
            },
            StatusCode::RANGE_NOT_SATISFIABLE => ProbeOutcome {
                total_size: content_range_total(&response),
                supports_ranges: true,
            },
            s if s.is_success() => ProbeOutcome {
                total_size: response.content_length(),
                supports_ranges: false,
            },
            s => return Err(DownloadError::http_status(url, s.as_u16())),
        };
        debug!(
            status = status.as_u16(),
            total_size = ?outcome.total_size,
            supports_ranges = outcome.supports_ranges,
            "probed direct link"
        );
        Ok(outcome)
    }

    /// Opens the response body, optionally restricted to `range` (inclusive).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::RangeIgnored`] when a ranged request is
    /// answered with the full body, otherwise a network or status error.
    pub async fn open(
        &self,
        link: &ResolvedLink,
        range: Option<(u64, u64)>,
    ) -> Result<Response, DownloadError> {
        let url = link.direct_url.as_str();
        let mut request = self.request(link)?;
        if let Some((start, end)) = range {
            request = request.header(RANGE, format!("bytes={start}-{end}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::from_request(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        if let Some((start, end)) = range
            && status != StatusCode::PARTIAL_CONTENT
        {
            return Err(DownloadError::RangeIgnored {
                url: url.to_string(),
                range: format!("{start}-{end}"),
            });
        }
        Ok(response)
    }

    fn request(&self, link: &ResolvedLink) -> Result<RequestBuilder, DownloadError> {
        let url = Url::parse(&link.direct_url)
            .map_err(|_| DownloadError::invalid_url(&link.direct_url))?;
        let mut request = match link.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
        };
        for (name, value) in &link.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(payload) = &link.payload {
            request = request.form(payload);
        }
        Ok(request)
    }
}

/// Total from `Content-Range: bytes 0-0/12345` (or `bytes */12345`).
fn content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_total(value)
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

fn build_client(connect: Duration, read: Duration) -> Result<Client, reqwest::Error> {
    // Ranges address raw bytes; no transparent decompression.
    Client::builder()
        .connect_timeout(connect)
        .read_timeout(read)
        .gzip(false)
        .user_agent(user_agent::default_download_user_agent())
        .build()
}
