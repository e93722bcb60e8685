//! Shared HTTP client construction policy for provider extractors.
//!
//! Extractors talk to hostile hosts: every client presents a browser
//! User-Agent, keeps cookies between the steps of one negotiation, and uses a
//! short timeout so a dead host fails over quickly.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Proxy};
use url::Url;

use crate::user_agent;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Builds the client used for provider page and API requests.
///
/// # Errors
///
/// Returns the builder error when TLS or proxy configuration fails.
pub fn build_provider_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    base_builder(timeout).build()
}

/// A cookie jar shared by a redirect-following client and one that never
/// follows redirects, for hosts that set a session on the page visit and
/// hand out the direct link in a `Location`-style header afterwards.
#[derive(Clone)]
pub struct SessionClients {
    pub follow: Client,
    pub no_redirect: Client,
    pub jar: Arc<Jar>,
}

impl SessionClients {
    /// Cookies the jar would send to `url`, as one `Cookie` header value.
    #[must_use]
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
            .filter(|value| !value.is_empty())
    }
}

/// Builds a fresh [`SessionClients`] pair over an empty jar.
///
/// # Errors
///
/// Returns the builder error when TLS or proxy configuration fails.
pub fn build_session_clients(timeout: Duration) -> Result<SessionClients, reqwest::Error> {
    let jar = Arc::new(Jar::default());
    let follow = base_builder(timeout)
        .cookie_provider(Arc::clone(&jar))
        .build()?;
    let no_redirect = base_builder(timeout)
        .cookie_provider(Arc::clone(&jar))
        .redirect(Policy::none())
        .build()?;
    Ok(SessionClients {
        follow,
        no_redirect,
        jar,
    })
}

fn base_builder(timeout: Duration) -> ClientBuilder {
    let builder = Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
        .timeout(timeout)
        .user_agent(user_agent::default_provider_user_agent())
        .cookie_store(true)
        .gzip(true);
    apply_env_proxy(builder)
}

fn apply_env_proxy(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = find_first_proxy_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = find_first_proxy_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
