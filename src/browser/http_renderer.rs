//! Plain HTTP page fetch for sites that serve their links without script.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use super::{InteractionStep, PageRenderer, RenderError};
use crate::provider::build_provider_http_client;

/// Fetches pages with a single GET; cannot run interaction steps.
#[derive(Debug, Clone)]
pub struct HttpPageRenderer {
    client: Client,
}

impl HttpPageRenderer {
    /// Builds a renderer with the provider client policy.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Fetch`] when the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, RenderError> {
        let client = build_provider_http_client(timeout)
            .map_err(|e| RenderError::fetch("<client>", e))?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    #[instrument(skip(self), fields(url = %url))]
    async fn render(&self, url: &str) -> Result<String, RenderError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RenderError::fetch(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RenderError::fetch(url, format!("HTTP {}", status.as_u16())));
        }
        let body = response.text().await.map_err(|e| RenderError::fetch(url, e))?;
        debug!(bytes = body.len(), "page fetched");
        Ok(body)
    }

    async fn render_and_interact(
        &self,
        url: &str,
        steps: &[InteractionStep],
    ) -> Result<String, RenderError> {
        if steps.is_empty() {
            return self.render(url).await;
        }
        Err(RenderError::unsupported("interaction steps over plain HTTP"))
    }
}
