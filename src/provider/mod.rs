//! Hosting providers: descriptors, link negotiation, and priority selection.
//!
//! # Architecture
//!
//! - [`ProviderDescriptor`] - static facts about one host (patterns, priority, worker policy)
//! - [`ProviderExtractor`] - async trait turning a provider page into a [`ResolvedLink`]
//! - [`ProviderRegistry`] - descriptor table, `select_best` tie-break authority, and the
//!   extractor boundary that converts failures into "try the next provider"
//!
//! Extractor shapes:
//! - [`TriggerRedirectExtractor`] - page fetch, then an ajax trigger answered by a redirect header
//! - [`FormTokenExtractor`] - hidden form token submitted after a host-imposed wait
//! - [`IdentifierPostExtractor`] - id from the URL path POSTed to a fixed JSON endpoint
//! - [`BrowserCountdownExtractor`] - browser session, countdown button, observed network traffic
//! - [`CookieSessionExtractor`] - browser session that also yields an account cookie
//! - [`PageButtonExtractor`] - script redirects followed to a download button

mod browser_countdown;
mod cookie_session;
mod debrid;
mod error;
mod form_token;
pub mod html;
mod http_client;
mod identifier_post;
mod page_button;
mod registry;
mod trigger_redirect;

pub use browser_countdown::{BrowserCountdownConfig, BrowserCountdownExtractor};
pub use cookie_session::{CookieSessionConfig, CookieSessionExtractor};
pub use debrid::DebridClient;
pub use error::ExtractError;
pub use form_token::{FormTokenConfig, FormTokenExtractor};
pub use http_client::{SessionClients, build_provider_http_client, build_session_clients};
pub use identifier_post::{IdentifierPostConfig, IdentifierPostExtractor};
pub use page_button::PageButtonExtractor;
pub use registry::{BuiltinOptions, ProviderRegistry, ResolvedCandidate};
pub use trigger_redirect::TriggerRedirectExtractor;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

/// HTTP method the direct link must be requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// Static description of a hosting provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    /// Unique id, e.g. `"buzzheavier"`.
    pub key: String,
    /// Provider URL built from the id captured by `link_pattern`; `{id}` is substituted.
    pub url_template: String,
    /// Recognizes a URL as belonging to this provider.
    pub identifier_pattern: Regex,
    /// Finds embedded links in page HTML; capture group 1 is the provider id.
    pub link_pattern: Regex,
    /// Lower wins.
    pub priority: u32,
    pub enabled: bool,
    /// Recommended parallel connections; `0` effectively disables the host.
    pub default_worker_count: usize,
    pub inter_worker_delay: Duration,
    pub file_extension_hint: String,
}

impl ProviderDescriptor {
    /// True when `url` matches this provider's identifier pattern.
    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        self.identifier_pattern.is_match(url)
    }

    /// Builds the provider URL for an id captured from page HTML.
    #[must_use]
    pub fn format_url(&self, id: &str) -> String {
        self.url_template.replace("{id}", id)
    }

    /// The provider URL embedded in `html` when the link pattern matches
    /// exactly once. Repeated or multiple matches count as ambiguous.
    #[must_use]
    pub fn sole_link(&self, html: &str) -> Option<String> {
        let mut matches = self.link_pattern.captures_iter(html);
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        first.get(1).map(|id| self.format_url(id.as_str()))
    }

    /// Usable when enabled with at least one worker.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && self.default_worker_count > 0
    }
}

/// A direct byte-serving link plus everything needed to request it.
///
/// Produced per resolution attempt and consumed immediately by the downloader.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLink {
    pub provider_key: String,
    pub direct_url: String,
    pub headers: BTreeMap<String, String>,
    /// Form fields for hosts that serve the file in answer to a POST.
    pub payload: Option<BTreeMap<String, String>>,
    pub method: HttpMethod,
    /// Account/session token the host ties the link to.
    pub session_token: Option<String>,
    pub worker_count: usize,
    pub inter_worker_delay: Duration,
    pub file_extension: String,
}

impl ResolvedLink {
    /// Plain GET link with no extra request state.
    #[must_use]
    pub fn get(provider_key: &str, direct_url: impl Into<String>) -> Self {
        Self {
            provider_key: provider_key.to_string(),
            direct_url: direct_url.into(),
            headers: BTreeMap::new(),
            payload: None,
            method: HttpMethod::Get,
            session_token: None,
            worker_count: 1,
            inter_worker_delay: Duration::ZERO,
            file_extension: String::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// True when the link can be fetched by a tool that knows only the URL.
    #[must_use]
    pub fn is_plain_get(&self) -> bool {
        self.method == HttpMethod::Get
            && self.headers.is_empty()
            && self.payload.is_none()
            && self.session_token.is_none()
    }

    /// Applies the descriptor's fixed worker policy and extension fallback.
    pub(crate) fn apply_policy(&mut self, descriptor: &ProviderDescriptor) {
        self.worker_count = descriptor.default_worker_count.max(1);
        self.inter_worker_delay = descriptor.inter_worker_delay;
        if self.file_extension.is_empty() {
            self.file_extension.clone_from(&descriptor.file_extension_hint);
        }
    }
}

/// Host-specific negotiation from provider page to direct link.
///
/// `Ok(None)` means the protocol ran to completion without producing a link
/// (for example a browser observation window elapsed); the registry treats it
/// like an error and moves on.
#[async_trait]
pub trait ProviderExtractor: Send + Sync {
    /// Key of the descriptor this extractor serves.
    fn key(&self) -> &str;

    /// Negotiates a direct link for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] for any unrecoverable protocol failure.
    async fn extract(&self, url: &str) -> Result<Option<ResolvedLink>, ExtractError>;
}

/// Extension of the last path segment of `url`, lowercased.
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?.to_string();
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then(|| ext.to_ascii_lowercase())
}

/// First non-empty path segment after the host.
pub(crate) fn first_path_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Last non-empty path segment.
pub(crate) fn last_path_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            key: "buzzheavier".into(),
            url_template: "https://buzzheavier.com/{id}".into(),
            identifier_pattern: Regex::new(r"https?://(www\.)?buzzheavier\.com/").unwrap(),
            link_pattern: Regex::new(r"buzzheavier\.com/([a-zA-Z0-9\-]+)").unwrap(),
            priority: 3,
            enabled: true,
            default_worker_count: 5,
            inter_worker_delay: Duration::from_millis(500),
            file_extension_hint: "rar".into(),
        }
    }

    #[test]
    fn test_sole_link_requires_exactly_one_match() {
        let once = r#"<a href="https://buzzheavier.com/abc-1">x</a>"#;
        assert_eq!(
            descriptor().sole_link(once).as_deref(),
            Some("https://buzzheavier.com/abc-1")
        );

        let repeated = r#"<a href="https://buzzheavier.com/abc-1">x</a>
            <a href="https://buzzheavier.com/abc-1">again</a>"#;
        assert_eq!(descriptor().sole_link(repeated), None);

        assert_eq!(descriptor().sole_link("<p>nothing here</p>"), None);
    }

    #[test]
    fn test_plain_get_detection() {
        let link = ResolvedLink::get("voe", "https://cdn.test/f.mp4");
        assert!(link.is_plain_get());
        assert!(!link.clone().with_header("Referer", "x").is_plain_get());
        assert!(!link.clone().with_session_token("t").is_plain_get());
        let mut post = link;
        post.method = HttpMethod::Post;
        assert!(!post.is_plain_get());
    }

    #[test]
    fn test_apply_policy_floors_workers_and_fills_extension() {
        let mut d = descriptor();
        d.default_worker_count = 0;
        let mut link = ResolvedLink::get("buzzheavier", "https://cdn.test/f");
        link.apply_policy(&d);
        assert_eq!(link.worker_count, 1);
        assert_eq!(link.file_extension, "rar");
        assert_eq!(link.inter_worker_delay, Duration::from_millis(500));

        let mut keeps = ResolvedLink::get("voe", "https://cdn.test/f").with_extension("mkv");
        keeps.apply_policy(&d);
        assert_eq!(keeps.file_extension, "mkv");
    }

    #[test]
    fn test_url_helpers() {
        assert_eq!(extension_from_url("https://c.test/a/Movie.MP4?x=1").as_deref(), Some("mp4"));
        assert_eq!(extension_from_url("https://c.test/a/noext"), None);
        assert_eq!(first_path_segment("https://datanodes.to/abc123/file.rar").as_deref(), Some("abc123"));
        assert_eq!(last_path_segment("https://gofile.io/d/XyZ/").as_deref(), Some("XyZ"));
    }
}
