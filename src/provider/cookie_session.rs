//! Hosts that bind the direct link to an account cookie minted in-browser.
//!
//! The page's own script creates a guest account and fetches the folder
//! listing from the host API. Both the account cookie and that API response
//! are observed from the browser session; the link is useless without the
//! cookie, so it travels in the link's headers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{ExtractError, ProviderExtractor, ResolvedLink, extension_from_url, last_path_segment};
use crate::browser::{BrowserDriver, BrowserSession, NetworkEventKind};

#[derive(Debug, Clone)]
pub struct CookieSessionConfig {
    pub cookie_name: String,
    /// Substring of the listing API URL; `{id}` is the folder id.
    pub listing_url_marker: String,
    pub wait: Duration,
    pub poll_interval: Duration,
}

impl Default for CookieSessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "accountToken".to_string(),
            listing_url_marker: "api.gofile.io/contents/{id}".to_string(),
            wait: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct CookieSessionExtractor {
    key: String,
    driver: Arc<dyn BrowserDriver>,
    config: CookieSessionConfig,
}

impl CookieSessionExtractor {
    #[must_use]
    pub fn new(key: &str, driver: Arc<dyn BrowserDriver>, config: CookieSessionConfig) -> Self {
        Self {
            key: key.to_string(),
            driver,
            config,
        }
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        url: &str,
        id: &str,
    ) -> Result<Option<ResolvedLink>, ExtractError> {
        let browser_err = |e| ExtractError::browser_unavailable(&self.key, e);
        let marker = self.config.listing_url_marker.replace("{id}", id);
        session.navigate(url).await.map_err(browser_err)?;

        let mut token: Option<String> = None;
        let mut link: Option<String> = None;
        let deadline = tokio::time::Instant::now() + self.config.wait;

        loop {
            if token.is_none() {
                token = session
                    .cookies()
                    .await
                    .map_err(browser_err)?
                    .into_iter()
                    .find(|cookie| cookie.name == self.config.cookie_name)
                    .map(|cookie| cookie.value);
            }
            if link.is_none() {
                link = session
                    .drain_network_events()
                    .await
                    .map_err(browser_err)?
                    .into_iter()
                    .filter(|event| event.kind == NetworkEventKind::Response && event.url.contains(&marker))
                    .find_map(|event| event.body.as_deref().and_then(first_child_link));
            }

            if let (Some(token), Some(link)) = (&token, &link) {
                info!("account cookie and listing observed");
                let mut resolved = ResolvedLink::get(&self.key, link.clone())
                    .with_header("Cookie", format!("{}={token}", self.config.cookie_name))
                    .with_session_token(token.clone());
                if let Some(ext) = extension_from_url(link) {
                    resolved = resolved.with_extension(ext);
                }
                return Ok(Some(resolved));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    have_cookie = token.is_some(),
                    have_link = link.is_some(),
                    "session artifacts not observed in time"
                );
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// `data.children.<first>.link` from a folder listing.
fn first_child_link(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body)
        .inspect_err(|error| debug!(error = %error, "listing body is not JSON"))
        .ok()?;
    json.get("data")?
        .get("children")?
        .as_object()?
        .values()
        .find_map(|child| child.get("link")?.as_str().map(str::to_string))
}

#[async_trait]
impl ProviderExtractor for CookieSessionExtractor {
    fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(provider = %self.key))]
    async fn extract(&self, url: &str) -> Result<Option<ResolvedLink>, ExtractError> {
        let id = last_path_segment(url).ok_or_else(|| ExtractError::invalid_url(&self.key, url))?;
        let mut session = self
            .driver
            .open()
            .await
            .map_err(|e| ExtractError::browser_unavailable(&self.key, e))?;
        let outcome = self.drive(session.as_mut(), url, &id).await;
        session.close().await;
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::browser::testing::{Script, ScriptedDriver};
    use crate::browser::{BrowserCookie, NetworkEvent};

    fn fast_config() -> CookieSessionConfig {
        CookieSessionConfig {
            wait: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
            ..CookieSessionConfig::default()
        }
    }

    const LISTING: &str = r#"{"status":"ok","data":{"children":{"c1":{"type":"file","link":"https://store1.gofile.io/download/web/c1/Game.rar"}}}}"#;

    #[tokio::test]
    async fn test_bundles_cookie_into_headers() {
        let driver = ScriptedDriver::new(Script {
            cookies: vec![BrowserCookie {
                name: "accountToken".into(),
                value: "tok123".into(),
                domain: Some(".gofile.io".into()),
            }],
            network_batches: VecDeque::from(vec![
                vec![NetworkEvent::response("https://api.gofile.io/accounts", "{}")],
                vec![NetworkEvent::response(
                    "https://api.gofile.io/contents/AbC?wt=4fd6",
                    LISTING,
                )],
            ]),
            ..Script::default()
        });
        let extractor = CookieSessionExtractor::new("gofile", Arc::new(driver), fast_config());

        let link = extractor.extract("https://gofile.io/d/AbC").await.unwrap().unwrap();
        assert_eq!(link.direct_url, "https://store1.gofile.io/download/web/c1/Game.rar");
        assert_eq!(link.headers.get("Cookie").map(String::as_str), Some("accountToken=tok123"));
        assert_eq!(link.session_token.as_deref(), Some("tok123"));
        assert!(!link.is_plain_get());
    }

    #[tokio::test]
    async fn test_missing_cookie_returns_none() {
        let driver = ScriptedDriver::new(Script {
            network_batches: VecDeque::from(vec![vec![NetworkEvent::response(
                "https://api.gofile.io/contents/AbC",
                LISTING,
            )]]),
            ..Script::default()
        });
        let extractor = CookieSessionExtractor::new("gofile", Arc::new(driver), fast_config());
        assert!(extractor.extract("https://gofile.io/d/AbC").await.unwrap().is_none());
    }

    #[test]
    fn test_first_child_link_shapes() {
        assert!(first_child_link("not json").is_none());
        assert!(first_child_link(r#"{"data":{"children":{}}}"#).is_none());
        assert_eq!(
            first_child_link(LISTING).as_deref(),
            Some("https://store1.gofile.io/download/web/c1/Game.rar")
        );
    }
}
