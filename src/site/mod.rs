//! Content pages to candidate provider links.
//!
//! A site descriptor says how to fetch a content page and where its provider
//! links live. A URL that already belongs to a provider bypasses the site
//! table and becomes a single-candidate map.

use std::sync::{Arc, LazyLock};

use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::browser::{PageRenderer, RenderError};
use crate::provider::ProviderRegistry;
use crate::provider::html::{compile_static_regex, find_anchor_href_containing};

const FALLBACK_NAME_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum SiteError {
    /// Neither a known site nor a provider URL.
    #[error("URL not supported or no direct provider found: {url}")]
    UnsupportedSite { url: String },

    #[error("fetching content page {url} failed: {source}")]
    Render {
        url: String,
        #[source]
        source: RenderError,
    },
}

/// How a site's pages must be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Through the serialized browser renderer.
    Rendered,
    /// Plain HTTP GET.
    Plain,
}

/// How the display name is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameRule {
    /// Clean title from the URL slug.
    Slug,
    Fixed(String),
}

/// Static description of a content site.
#[derive(Debug, Clone)]
pub struct SiteDescriptor {
    pub key: String,
    pub host_pattern: Regex,
    pub fetch: FetchMode,
    pub name_rule: NameRule,
    /// Providers whose link is the first anchor whose href contains the needle,
    /// instead of the provider's `link_pattern`.
    pub anchor_overrides: Vec<(String, String)>,
}

impl SiteDescriptor {
    /// Built-in sites.
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        vec![
            Self {
                key: "steamrip".to_string(),
                host_pattern: compile_static_regex(r"(?i)^https?://(?:www\.)?steamrip\.com/"),
                fetch: FetchMode::Rendered,
                name_rule: NameRule::Slug,
                anchor_overrides: Vec::new(),
            },
            Self {
                key: "filmpalast".to_string(),
                host_pattern: compile_static_regex(r"(?i)^https?://(?:www\.)?filmpalast\.to/"),
                fetch: FetchMode::Plain,
                name_rule: NameRule::Fixed("Filmpalast_Video".to_string()),
                anchor_overrides: vec![("voe".to_string(), "voe.sx".to_string())],
            },
        ]
    }
}

/// Ordered candidate map plus the name to show for the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLinks {
    pub name: String,
    /// `(provider_key, url)` in provider registration order; `None` when absent or ambiguous.
    pub links: Vec<(String, Option<String>)>,
}

/// Turns a content URL into provider candidates.
pub struct SiteResolver {
    sites: Vec<SiteDescriptor>,
    registry: Arc<ProviderRegistry>,
    rendered: Arc<dyn PageRenderer>,
    plain: Arc<dyn PageRenderer>,
}

impl SiteResolver {
    /// `rendered` should be a serialized render queue; `plain` a direct HTTP fetcher.
    #[must_use]
    pub fn new(
        sites: Vec<SiteDescriptor>,
        registry: Arc<ProviderRegistry>,
        rendered: Arc<dyn PageRenderer>,
        plain: Arc<dyn PageRenderer>,
    ) -> Self {
        Self {
            sites,
            registry,
            rendered,
            plain,
        }
    }

    /// Resolves `url` into candidates.
    ///
    /// # Errors
    ///
    /// [`SiteError::UnsupportedSite`] when the URL matches nothing known, and
    /// [`SiteError::Render`] when the content page cannot be fetched.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn resolve(&self, url: &str) -> Result<SiteLinks, SiteError> {
        if let Some(provider) = self.registry.identify(url) {
            debug!(provider = %provider.key, "URL is a provider link");
            return Ok(SiteLinks {
                name: name_from_url(url).unwrap_or_else(random_name),
                links: vec![(provider.key.clone(), Some(url.to_string()))],
            });
        }

        let site = self
            .sites
            .iter()
            .find(|site| site.host_pattern.is_match(url))
            .ok_or_else(|| SiteError::UnsupportedSite {
                url: url.to_string(),
            })?;

        let renderer = match site.fetch {
            FetchMode::Rendered => &self.rendered,
            FetchMode::Plain => &self.plain,
        };
        let html = renderer.render(url).await.map_err(|source| SiteError::Render {
            url: url.to_string(),
            source,
        })?;

        let links = self.extract_candidates(site, &html);
        let name = match &site.name_rule {
            NameRule::Fixed(name) => name.clone(),
            NameRule::Slug => name_from_url(url).unwrap_or_else(random_name),
        };
        info!(
            site = %site.key,
            found = links.iter().filter(|(_, u)| u.is_some()).count(),
            "content page scanned"
        );
        Ok(SiteLinks { name, links })
    }

    fn extract_candidates(&self, site: &SiteDescriptor, html: &str) -> Vec<(String, Option<String>)> {
        self.registry
            .descriptors()
            .map(|descriptor| {
                let link = if let Some((_, needle)) = site
                    .anchor_overrides
                    .iter()
                    .find(|(key, _)| key == &descriptor.key)
                {
                    find_anchor_href_containing(html, needle)
                } else {
                    // A link that is repeated or has rivals is ambiguous.
                    descriptor.sole_link(html)
                };
                (descriptor.key.clone(), link)
            })
            .collect()
    }
}

static VERSION_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"-v?\d+[\d.\-]*.*$"));
static BUILD_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"-build-\d+.*$"));
static RIP_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"-rip.*$"));

/// Clean title from the last path segment, or `None` when there is no usable slug.
///
/// `https://steamrip.com/hollow-knight-v1-5-free-download/` becomes `"Hollow Knight"`.
#[must_use]
pub fn name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let slug = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()?
        .to_ascii_lowercase();

    let slug = match slug.split_once("free-download") {
        Some((head, _)) => head.trim_end_matches('-').to_string(),
        None => slug,
    };
    let slug = BUILD_SUFFIX_RE.replace(&slug, "");
    let slug = VERSION_SUFFIX_RE.replace(&slug, "");
    let slug = RIP_SUFFIX_RE.replace(&slug, "");

    let title = slug
        .split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect::<Vec<_>>()
        .join(" ");
    (!title.is_empty()).then_some(title)
}

fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(FALLBACK_NAME_LEN)
        .map(char::from)
        .collect()
}
