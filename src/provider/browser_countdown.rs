//! Hosts that only release the file to a real browser after a countdown.
//!
//! The direct link never appears in the page. After clicking the gated
//! button, the browser's own outgoing traffic is observed for a request whose
//! URL looks like the file.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::html::compile_static_regex;
use super::{ExtractError, ProviderExtractor, ResolvedLink, extension_from_url};
use crate::browser::{BrowserDriver, BrowserSession, ElementLocator, NetworkEventKind};

#[derive(Debug, Clone)]
pub struct BrowserCountdownConfig {
    /// Optional "start" control; its absence is not an error.
    pub start_control: Option<ElementLocator>,
    pub start_wait: Duration,
    pub attempt_challenge: bool,
    pub challenge_wait: Duration,
    pub countdown_button: ElementLocator,
    /// Bound on how long the countdown may take to unlock the button.
    pub countdown_wait: Duration,
    pub observe_window: Duration,
    pub poll_interval: Duration,
    /// Matches request URLs that serve the file directly.
    pub direct_file_pattern: Regex,
}

impl Default for BrowserCountdownConfig {
    fn default() -> Self {
        Self {
            start_control: Some(ElementLocator::Text("Free Download".to_string())),
            start_wait: Duration::from_secs(3),
            attempt_challenge: true,
            challenge_wait: Duration::from_secs(5),
            countdown_button: ElementLocator::Id("downloadbtn".to_string()),
            countdown_wait: Duration::from_secs(60),
            observe_window: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            direct_file_pattern: compile_static_regex(r"(?i)\.rar(?:[?#]|$)|megadb\.net/d/"),
        }
    }
}

pub struct BrowserCountdownExtractor {
    key: String,
    driver: Arc<dyn BrowserDriver>,
    config: BrowserCountdownConfig,
}

impl BrowserCountdownExtractor {
    #[must_use]
    pub fn new(key: &str, driver: Arc<dyn BrowserDriver>, config: BrowserCountdownConfig) -> Self {
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
    ) -> Result<Option<ResolvedLink>, ExtractError> {
        let browser_err = |e| ExtractError::browser_unavailable(&self.key, e);
        session.navigate(url).await.map_err(browser_err)?;

        if let Some(start) = &self.config.start_control
            && let Err(error) = session.click(start, self.config.start_wait).await
        {
            debug!(error = %error, "start control absent");
        }
        if self.config.attempt_challenge
            && let Err(error) = session.solve_checkbox_challenge(self.config.challenge_wait).await
        {
            debug!(error = %error, "challenge dismissal failed; continuing");
        }

        // Discard traffic from page load so only post-click requests are inspected.
        session.drain_network_events().await.map_err(browser_err)?;
        session
            .click(&self.config.countdown_button, self.config.countdown_wait)
            .await
            .map_err(|e| {
                ExtractError::extraction_failed(&self.key, format!("countdown button: {e}"))
            })?;

        let deadline = tokio::time::Instant::now() + self.config.observe_window;
        loop {
            let events = session.drain_network_events().await.map_err(browser_err)?;
            if let Some(hit) = events.into_iter().find(|event| {
                event.kind == NetworkEventKind::Request
                    && self.config.direct_file_pattern.is_match(&event.url)
            }) {
                info!(url = %hit.url, "direct file request observed");
                let mut link = ResolvedLink::get(&self.key, hit.url.clone());
                if let Some(ext) = extension_from_url(&hit.url) {
                    link = link.with_extension(ext);
                }
                return Ok(Some(link));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(window = ?self.config.observe_window, "no direct file request observed");
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl ProviderExtractor for BrowserCountdownExtractor {
    fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(provider = %self.key))]
    async fn extract(&self, url: &str) -> Result<Option<ResolvedLink>, ExtractError> {
        let mut session = self
            .driver
            .open()
            .await
            .map_err(|e| ExtractError::browser_unavailable(&self.key, e))?;
        let outcome = self.drive(session.as_mut(), url).await;
        session.close().await;
        outcome
    }
}
