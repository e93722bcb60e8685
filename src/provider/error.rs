//! Error types for provider link extraction.

use thiserror::Error;

use crate::browser::RenderError;

/// Failures while negotiating a direct link with a hosting provider.
///
/// These never cross the registry boundary: [`super::ProviderRegistry::resolve_link`]
/// logs them and reports "no link" so the caller can try the next provider.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The URL does not belong to the provider or cannot be parsed.
    #[error("[{provider}] invalid provider URL: {url}")]
    InvalidUrl { provider: String, url: String },

    /// No descriptor is registered under this key.
    #[error("unknown provider '{provider}'")]
    UnknownProvider { provider: String },

    /// The final step produced no usable link.
    #[error("[{provider}] extraction failed: {reason}")]
    ExtractionFailed { provider: String, reason: String },

    /// A structural element the protocol depends on is missing.
    #[error("[{provider}] page layout changed: {missing} not found")]
    PageLayoutChanged { provider: String, missing: String },

    /// The page has the expected form but no token field.
    #[error("[{provider}] token field '{field}' not found")]
    TokenNotFound { provider: String, field: String },

    /// The host requires a browser session but none is configured.
    #[error("[{provider}] browser session required but unavailable: {source}")]
    BrowserUnavailable {
        provider: String,
        #[source]
        source: RenderError,
    },

    /// The host answered with a non-success status.
    #[error("[{provider}] HTTP {status} from {url}")]
    HttpStatus {
        provider: String,
        url: String,
        status: u16,
    },

    /// Transport-level failure talking to the host.
    #[error("[{provider}] request to {url} failed: {source}")]
    Http {
        provider: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ExtractError {
    pub fn invalid_url(provider: &str, url: impl Into<String>) -> Self {
        Self::InvalidUrl {
            provider: provider.to_string(),
            url: url.into(),
        }
    }

    pub fn unknown_provider(provider: &str) -> Self {
        Self::UnknownProvider {
            provider: provider.to_string(),
        }
    }

    pub fn extraction_failed(provider: &str, reason: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn layout_changed(provider: &str, missing: impl Into<String>) -> Self {
        Self::PageLayoutChanged {
            provider: provider.to_string(),
            missing: missing.into(),
        }
    }

    pub fn token_not_found(provider: &str, field: impl Into<String>) -> Self {
        Self::TokenNotFound {
            provider: provider.to_string(),
            field: field.into(),
        }
    }

    pub fn browser_unavailable(provider: &str, source: RenderError) -> Self {
        Self::BrowserUnavailable {
            provider: provider.to_string(),
            source,
        }
    }

    pub fn http_status(provider: &str, url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            provider: provider.to_string(),
            url: url.into(),
            status,
        }
    }

    pub fn http(provider: &str, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            provider: provider.to_string(),
            url: url.into(),
            source,
        }
    }
}
