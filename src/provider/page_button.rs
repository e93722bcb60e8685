//! Hosts that bounce through script redirects before exposing a download button.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use super::html::{absolutize_url, find_anchor_with_classes, find_js_redirect};
use super::{ExtractError, ProviderExtractor, ResolvedLink, extension_from_url};

const DOWNLOAD_PATH: &str = "download";
const BUTTON_CLASS: &str = "btn";

pub struct PageButtonExtractor {
    key: String,
    client: Client,
}

impl PageButtonExtractor {
    #[must_use]
    pub fn new(key: &str, client: Client) -> Self {
        Self {
            key: key.to_string(),
            client,
        }
    }

    async fn get_text(&self, url: &str) -> Result<String, ExtractError> {
        let response = self
            .client
            .get(url)
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

    /// Fetches `url`, following one script redirect; returns the landing URL and body.
    async fn land(&self, url: &str) -> Result<(String, String), ExtractError> {
        let body = self.get_text(url).await?;
        let Some(target) = find_js_redirect(&body) else {
            return Ok((url.to_string(), body));
        };
        let base = Url::parse(url).map_err(|_| ExtractError::invalid_url(&self.key, url))?;
        let next = absolutize_url(&target, &base)
            .ok_or_else(|| ExtractError::layout_changed(&self.key, "script redirect target"))?;
        debug!(from = %url, to = %next, "following script redirect");
        let body = self.get_text(&next).await?;
        Ok((next, body))
    }
}

#[async_trait]
impl ProviderExtractor for PageButtonExtractor {
    fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(provider = %self.key))]
    async fn extract(&self, url: &str) -> Result<Option<ResolvedLink>, ExtractError> {
        let (landing, _) = self.land(url).await?;
        let download_page = format!("{}/{DOWNLOAD_PATH}", landing.trim_end_matches('/'));
        let (final_page, body) = self.land(&download_page).await?;

        let href = find_anchor_with_classes(&body, BUTTON_CLASS)
            .ok_or_else(|| ExtractError::extraction_failed(&self.key, "no download button"))?;
        let base = Url::parse(&final_page).map_err(|_| ExtractError::invalid_url(&self.key, &final_page))?;
        let direct = absolutize_url(&href, &base)
            .ok_or_else(|| ExtractError::extraction_failed(&self.key, "unusable button href"))?;

        let mut link = ResolvedLink::get(&self.key, direct.clone());
        if let Some(ext) = extension_from_url(&direct) {
            link = link.with_extension(ext);
        }
        Ok(Some(link))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::provider::build_provider_http_client;

    fn extractor() -> PageButtonExtractor {
        PageButtonExtractor::new("voe", build_provider_http_client(Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn test_follows_redirects_to_button() {
        let server = MockServer::start().await;
        let uri = server.uri();
        Mock::given(method("GET"))
            .and(path("/e/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<script>window.location.href = '{uri}/mirror/abc';</script>"
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>player</html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror/abc/download"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a class="nav" href="/home">h</a><a class="btn btn-primary" href="https://delivery.test/v/Movie.mkv?t=1">Download</a>"#,
            ))
            .mount(&server)
            .await;

        let link = extractor()
            .extract(&format!("{uri}/e/abc"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.direct_url, "https://delivery.test/v/Movie.mkv?t=1");
        assert_eq!(link.file_extension, "mkv");
    }

    #[tokio::test]
    async fn test_no_button_is_extraction_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>nothing</p>"))
            .mount(&server)
            .await;
        let err = extractor()
            .extract(&format!("{}/x", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed { .. }));
    }
}
