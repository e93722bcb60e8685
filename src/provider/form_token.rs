//! Hosts that gate the link behind a hidden form token and a wait window.
//!
//! The wait is enforced by the host: submitting early gets the request
//! rejected, so it is never skipped.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, instrument};
use url::Url;

use super::html::{absolutize_url, find_anchor_with_classes, find_form_by_id};
use super::{ExtractError, ProviderExtractor, ResolvedLink};

#[derive(Debug, Clone)]
pub struct FormTokenConfig {
    pub form_id: String,
    pub token_field: String,
    /// Class signature of the anchor carrying the direct link.
    pub result_anchor_classes: String,
    pub wait: Duration,
}

impl Default for FormTokenConfig {
    fn default() -> Self {
        Self {
            form_id: "f1".to_string(),
            token_field: "adz".to_string(),
            result_anchor_classes: "ok btn-general btn-orange".to_string(),
            wait: Duration::from_secs(62),
        }
    }
}

pub struct FormTokenExtractor {
    key: String,
    client: Client,
    config: FormTokenConfig,
}

impl FormTokenExtractor {
    #[must_use]
    pub fn new(key: &str, client: Client, config: FormTokenConfig) -> Self {
        Self {
            key: key.to_string(),
            client,
            config,
        }
    }

    async fn fetch_text(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String, ExtractError> {
        let response = request
            .send()
            .await
            .map_err(|e| ExtractError::http(&self.key, url, e))?;
        if !response.status().is_success() {
            return Err(ExtractError::http_status(&self.key, url, response.status().as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| ExtractError::http(&self.key, url, e))
    }
}

#[async_trait]
impl ProviderExtractor for FormTokenExtractor {
    fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(provider = %self.key))]
    async fn extract(&self, url: &str) -> Result<Option<ResolvedLink>, ExtractError> {
        let base = Url::parse(url).map_err(|_| ExtractError::invalid_url(&self.key, url))?;
        let page = self.fetch_text(self.client.get(url), url).await?;

        let form = find_form_by_id(&page, &self.config.form_id).ok_or_else(|| {
            ExtractError::layout_changed(&self.key, format!("form#{}", self.config.form_id))
        })?;
        let token = form
            .input_value(&self.config.token_field)
            .ok_or_else(|| ExtractError::token_not_found(&self.key, &self.config.token_field))?;
        let action = form
            .action()
            .and_then(|action| absolutize_url(action, &base))
            .unwrap_or_else(|| url.to_string());

        info!(wait_secs = self.config.wait.as_secs(), "waiting out host-imposed delay");
        tokio::time::sleep(self.config.wait).await;

        debug!(action = %action, "submitting form token");
        let result = self
            .fetch_text(
                self.client
                    .post(&action)
                    .form(&[(self.config.token_field.as_str(), token.as_str())]),
                &action,
            )
            .await?;

        let href = find_anchor_with_classes(&result, &self.config.result_anchor_classes)
            .ok_or_else(|| ExtractError::extraction_failed(&self.key, "download anchor missing after submit"))?;
        let direct = absolutize_url(&href, &base)
            .ok_or_else(|| ExtractError::extraction_failed(&self.key, "unusable download anchor"))?;
        Ok(Some(ResolvedLink::get(&self.key, direct)))
    }
}
