//! Optional debrid unrestriction of resolved links.
//!
//! A debrid service re-hosts the file behind its own CDN. When it accepts a
//! link, the replacement is a plain GET with no provider headers or session.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::ResolvedLink;
use crate::user_agent;

const REAL_DEBRID_ENDPOINT: &str = "https://api.real-debrid.com/rest/1.0/unrestrict/link";

#[derive(Debug, Deserialize)]
struct UnrestrictReply {
    download: Option<String>,
}

/// Client for the Real-Debrid `unrestrict/link` API.
#[derive(Clone)]
pub struct DebridClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl std::fmt::Debug for DebridClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebridClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl DebridClient {
    /// # Errors
    ///
    /// Returns the builder error when the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent::api_user_agent())
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: REAL_DEBRID_ENDPOINT.to_string(),
        })
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Returns a replacement link, or `None` to keep the original.
    #[instrument(skip(self, link), fields(provider = %link.provider_key))]
    pub async fn unrestrict(&self, link: &ResolvedLink) -> Option<ResolvedLink> {
        let response = match self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .form(&[("link", link.direct_url.as_str())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "debrid request failed; keeping provider link");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "debrid declined link");
            return None;
        }
        let download = response
            .json::<UnrestrictReply>()
            .await
            .inspect_err(|error| warn!(error = %error, "debrid reply unreadable"))
            .ok()?
            .download
            .filter(|url| !url.trim().is_empty())?;

        info!("using debrid link");
        Some(ResolvedLink {
            direct_url: download,
            headers: std::collections::BTreeMap::new(),
            payload: None,
            method: super::HttpMethod::Get,
            session_token: None,
            ..link.clone()
        })
    }
}
