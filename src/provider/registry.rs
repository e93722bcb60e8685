//! Provider table, priority selection, and the extractor boundary.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::html::compile_static_regex;
use super::{
    BrowserCountdownConfig, BrowserCountdownExtractor, CookieSessionConfig,
    CookieSessionExtractor, DebridClient, FormTokenConfig, FormTokenExtractor,
    IdentifierPostConfig, IdentifierPostExtractor, PageButtonExtractor, ProviderDescriptor,
    ProviderExtractor, ResolvedLink, TriggerRedirectExtractor, build_provider_http_client,
};
use crate::browser::BrowserDriver;
use crate::config::ProviderOverride;

const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// The winner of [`ProviderRegistry::select_best`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCandidate {
    pub provider_key: String,
    pub url: String,
    pub priority: u32,
}

/// Inputs for [`ProviderRegistry::builtin`].
#[derive(Clone)]
pub struct BuiltinOptions {
    /// Per-request timeout for provider negotiation.
    pub request_timeout: Duration,
    /// Host-imposed wait before form-token submission.
    pub form_token_wait: Duration,
    /// Browser capability for hosts that require one.
    pub browser: Option<Arc<dyn BrowserDriver>>,
    pub debrid: Option<DebridClient>,
}

impl Default for BuiltinOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            form_token_wait: FormTokenConfig::default().wait,
            browser: None,
            debrid: None,
        }
    }
}

struct ProviderEntry {
    descriptor: ProviderDescriptor,
    extractor: Option<Arc<dyn ProviderExtractor>>,
}

/// Registry of providers keyed by descriptor key.
///
/// Built once at startup, adjusted by config overrides, then shared read-only.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
    debrid: Option<DebridClient>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor`, replacing any entry with the same key.
    pub fn register(
        &mut self,
        descriptor: ProviderDescriptor,
        extractor: Option<Arc<dyn ProviderExtractor>>,
    ) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.descriptor.key == descriptor.key)
        {
            existing.descriptor = descriptor;
            existing.extractor = extractor;
            return;
        }
        self.entries.push(ProviderEntry {
            descriptor,
            extractor,
        });
    }

    pub fn set_debrid(&mut self, debrid: Option<DebridClient>) {
        self.debrid = debrid;
    }

    /// Looks up a descriptor by key.
    #[must_use]
    pub fn descriptor(&self, key: &str) -> Option<&ProviderDescriptor> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor.key == key)
            .map(|entry| &entry.descriptor)
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.entries.iter().map(|entry| &entry.descriptor)
    }

    /// The provider whose identifier pattern matches `url`.
    #[must_use]
    pub fn identify(&self, url: &str) -> Option<&ProviderDescriptor> {
        self.descriptors().find(|descriptor| descriptor.matches(url))
    }

    /// Applies config overrides; unknown keys are logged and ignored.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, ProviderOverride>) {
        for (key, change) in overrides {
            let Some(entry) = self.entries.iter_mut().find(|e| &e.descriptor.key == key) else {
                warn!(provider = %key, "override for unknown provider ignored");
                continue;
            };
            let descriptor = &mut entry.descriptor;
            if let Some(enabled) = change.enabled {
                descriptor.enabled = enabled;
            }
            if let Some(priority) = change.priority {
                descriptor.priority = priority;
            }
            if let Some(workers) = change.worker_count {
                descriptor.default_worker_count = workers;
            }
            if let Some(delay) = change.inter_worker_delay() {
                descriptor.inter_worker_delay = delay;
            }
            debug!(provider = %key, ?change, "provider override applied");
        }
    }

    /// Picks the usable candidate with the lowest priority.
    ///
    /// Entries are skipped when their key is in `ignore`, unknown, disabled,
    /// configured with zero workers, or carry no URL. The first-seen candidate
    /// wins an exact priority tie.
    #[must_use]
    pub fn select_best(
        &self,
        candidates: &[(String, Option<String>)],
        ignore: &HashSet<String>,
    ) -> Option<ResolvedCandidate> {
        let mut best: Option<ResolvedCandidate> = None;
        for (key, url) in candidates {
            if ignore.contains(key) {
                continue;
            }
            let Some(url) = url else { continue };
            let Some(descriptor) = self.descriptor(key) else {
                continue;
            };
            if !descriptor.is_usable() {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|current| descriptor.priority < current.priority)
            {
                best = Some(ResolvedCandidate {
                    provider_key: key.clone(),
                    url: url.clone(),
                    priority: descriptor.priority,
                });
            }
        }
        best
    }

    /// Runs the provider's extractor and applies its worker policy.
    ///
    /// Every failure is logged and reported as `None` so the caller can fall
    /// back to the next provider.
    #[instrument(skip(self), fields(provider = %key))]
    pub async fn resolve_link(&self, key: &str, url: &str) -> Option<ResolvedLink> {
        let Some(entry) = self.entries.iter().find(|e| e.descriptor.key == key) else {
            warn!("no descriptor registered for provider");
            return None;
        };
        let Some(extractor) = entry.extractor.as_ref() else {
            warn!("provider has no extractor available");
            return None;
        };

        let mut link = match extractor.extract(url).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                info!("provider produced no direct link");
                return None;
            }
            Err(error) => {
                warn!(error = %error, "provider extraction failed");
                return None;
            }
        };
        link.apply_policy(&entry.descriptor);

        if let Some(debrid) = &self.debrid
            && let Some(unrestricted) = debrid.unrestrict(&link).await
        {
            link = unrestricted;
        }

        info!(
            workers = link.worker_count,
            method = %link.method,
            plain = link.is_plain_get(),
            "direct link resolved"
        );
        Some(link)
    }

    /// Builds the registry with every known provider.
    ///
    /// Providers whose extractor cannot be constructed stay registered without
    /// one; [`resolve_link`](Self::resolve_link) then skips them.
    #[must_use]
    pub fn builtin(options: &BuiltinOptions) -> Self {
        let mut registry = Self::new();
        registry.set_debrid(options.debrid.clone());

        let client = match build_provider_http_client(options.request_timeout) {
            Ok(client) => Some(client),
            Err(error) => {
                warn!(error = %error, "provider HTTP client unavailable; HTTP providers disabled");
                None
            }
        };

        for descriptor in builtin_descriptors() {
            let extractor: Option<Arc<dyn ProviderExtractor>> = match descriptor.key.as_str() {
                "buzzheavier" => Some(Arc::new(TriggerRedirectExtractor::new(
                    "buzzheavier",
                    options.request_timeout,
                )) as Arc<dyn ProviderExtractor>),
                "fichier" => client.as_ref().map(|c| {
                    Arc::new(FormTokenExtractor::new(
                        "fichier",
                        c.clone(),
                        FormTokenConfig {
                            wait: options.form_token_wait,
                            ..FormTokenConfig::default()
                        },
                    )) as Arc<dyn ProviderExtractor>
                }),
                "datanode" => client.as_ref().map(|c| {
                    Arc::new(IdentifierPostExtractor::new(
                        "datanode",
                        c.clone(),
                        IdentifierPostConfig::default(),
                    )) as Arc<dyn ProviderExtractor>
                }),
                "megadb" => options.browser.as_ref().map(|driver| {
                    Arc::new(BrowserCountdownExtractor::new(
                        "megadb",
                        Arc::clone(driver),
                        BrowserCountdownConfig::default(),
                    )) as Arc<dyn ProviderExtractor>
                }),
                "gofile" => options.browser.as_ref().map(|driver| {
                    Arc::new(CookieSessionExtractor::new(
                        "gofile",
                        Arc::clone(driver),
                        CookieSessionConfig::default(),
                    )) as Arc<dyn ProviderExtractor>
                }),
                "voe" => client.as_ref().map(|c| {
                    Arc::new(PageButtonExtractor::new("voe", c.clone())) as Arc<dyn ProviderExtractor>
                }),
                _ => None,
            };
            if extractor.is_none() && descriptor.enabled {
                warn!(
                    provider = %descriptor.key,
                    "provider extractor unavailable; continuing with remaining providers"
                );
            }
            registry.register(descriptor, extractor);
        }
        registry
    }
}

struct BuiltinRow {
    key: &'static str,
    url_template: &'static str,
    identifier: &'static str,
    link: &'static str,
    priority: u32,
    enabled: bool,
    workers: usize,
    delay: Duration,
    extension: &'static str,
}

const BUILTIN_ROWS: &[BuiltinRow] = &[
    BuiltinRow {
        key: "gofile",
        url_template: "https://gofile.io/d/{id}",
        identifier: r"https://gofile\.io/d/(.+)",
        link: r"gofile\.io/d/([a-zA-Z0-9]+)",
        priority: 1,
        enabled: false,
        workers: 2,
        delay: DEFAULT_DELAY,
        extension: "rar",
    },
    BuiltinRow {
        key: "filecrypt",
        url_template: "https://www.filecrypt.cc/Container/{id}",
        identifier: r"https://(?:www\.)?filecrypt\.cc/Container/(.+)",
        link: r"filecrypt\.\w+/Container/([A-Za-z0-9]+)",
        priority: 2,
        enabled: false,
        workers: 0,
        delay: DEFAULT_DELAY,
        extension: "rar",
    },
    BuiltinRow {
        key: "buzzheavier",
        url_template: "https://buzzheavier.com/{id}",
        identifier: r"https://buzzheavier\.com/(.+)",
        link: r"buzzheavier\.com/([a-zA-Z0-9\-]+)",
        priority: 3,
        enabled: true,
        workers: 5,
        delay: DEFAULT_DELAY,
        extension: "rar",
    },
    BuiltinRow {
        key: "datanode",
        url_template: "https://datanodes.to/{id}",
        identifier: r"https://datanodes\.to/(.+)",
        link: r"datanodes\.to/([a-zA-Z0-9]+)",
        priority: 4,
        enabled: true,
        workers: 2,
        delay: DEFAULT_DELAY,
        extension: "rar",
    },
    BuiltinRow {
        key: "fichier",
        url_template: "https://1fichier.com/?{id}",
        identifier: r"https://1fichier\.com/\?(.+)",
        link: r"1fichier\.com/\?([a-zA-Z0-9]+)",
        priority: 5,
        enabled: true,
        workers: 1,
        delay: DEFAULT_DELAY,
        extension: "rar",
    },
    BuiltinRow {
        key: "megadb",
        url_template: "https://megadb.net/{id}",
        identifier: r"https://megadb\.net/(.+)",
        link: r"megadb\.net/([a-zA-Z0-9]+)",
        priority: 6,
        enabled: true,
        workers: 12,
        delay: Duration::from_secs(2),
        extension: "rar",
    },
    BuiltinRow {
        key: "strmup",
        url_template: "https://strmup.to/{id}",
        identifier: r"https://strmup\.to/(.*)",
        link: r"strmup\.to/([a-zA-Z0-9]+)",
        priority: 7,
        enabled: false,
        workers: 0,
        delay: DEFAULT_DELAY,
        extension: "mp4",
    },
    BuiltinRow {
        key: "veev",
        url_template: "https://veev.to/{id}",
        identifier: r"https://veev\.to/e/(.*)",
        link: r"veev\.to/([a-zA-Z0-9]+)",
        priority: 8,
        enabled: false,
        workers: 0,
        delay: DEFAULT_DELAY,
        extension: "mp4",
    },
    BuiltinRow {
        key: "voe",
        url_template: "https://voe.sx/{id}",
        identifier: r"https://voe\.sx/(.*)",
        link: r"voe\.sx/([a-zA-Z0-9]+)",
        priority: 9,
        enabled: true,
        workers: 25,
        delay: DEFAULT_DELAY,
        extension: "mp4",
    },
];

fn builtin_descriptors() -> Vec<ProviderDescriptor> {
    BUILTIN_ROWS
        .iter()
        .map(|row| ProviderDescriptor {
            key: row.key.to_string(),
            url_template: row.url_template.to_string(),
            identifier_pattern: compile_static_regex(row.identifier),
            link_pattern: compile_static_regex(row.link),
            priority: row.priority,
            enabled: row.enabled,
            default_worker_count: row.workers,
            inter_worker_delay: row.delay,
            file_extension_hint: row.extension.to_string(),
        })
        .collect()
}
