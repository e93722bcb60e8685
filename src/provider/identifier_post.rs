//! Hosts whose download endpoint takes an id lifted from the page URL.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::COOKIE;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{ExtractError, ProviderExtractor, ResolvedLink, first_path_segment};

#[derive(Debug, Clone)]
pub struct IdentifierPostConfig {
    pub endpoint: String,
    /// Cookie the endpoint expects, e.g. a language selector.
    pub cookie: Option<String>,
    /// Form fields sent alongside `id`.
    pub fields: Vec<(String, String)>,
}

impl Default for IdentifierPostConfig {
    fn default() -> Self {
        let endpoint = "https://datanodes.to/download".to_string();
        let fields = [
            ("op", "download2"),
            ("rand", ""),
            ("referer", endpoint.as_str()),
            ("method_free", "Kostenloser Download >> "),
            ("method_premium", ""),
            ("dl", "1"),
        ]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
        Self {
            endpoint,
            cookie: Some("lang=german".to_string()),
            fields,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EndpointReply {
    url: Option<String>,
}

pub struct IdentifierPostExtractor {
    key: String,
    client: Client,
    config: IdentifierPostConfig,
}

impl IdentifierPostExtractor {
    #[must_use]
    pub fn new(key: &str, client: Client, config: IdentifierPostConfig) -> Self {
        Self {
            key: key.to_string(),
            client,
            config,
        }
    }
}

#[async_trait]
impl ProviderExtractor for IdentifierPostExtractor {
    fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(provider = %self.key))]
    async fn extract(&self, url: &str) -> Result<Option<ResolvedLink>, ExtractError> {
        let id = first_path_segment(url).ok_or_else(|| ExtractError::invalid_url(&self.key, url))?;
        debug!(id = %id, "derived file id");

        let mut form: Vec<(&str, &str)> = vec![("id", id.as_str())];
        form.extend(self.config.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let endpoint = self.config.endpoint.as_str();
        let mut request = self.client.post(endpoint).form(&form);
        if let Some(cookie) = &self.config.cookie {
            request = request.header(COOKIE, cookie);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ExtractError::http(&self.key, endpoint, e))?;
        if !response.status().is_success() {
            return Err(ExtractError::http_status(&self.key, endpoint, response.status().as_u16()));
        }
        let reply: EndpointReply = response
            .json()
            .await
            .map_err(|e| ExtractError::http(&self.key, endpoint, e))?;

        let encoded = reply
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ExtractError::extraction_failed(&self.key, "endpoint reply has no url"))?;
        let direct = urlencoding::decode(&encoded)
            .map_err(|e| ExtractError::extraction_failed(&self.key, format!("undecodable url: {e}")))?
            .into_owned();
        Ok(Some(ResolvedLink::get(&self.key, direct)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::provider::build_provider_http_client;

    fn extractor(server: &MockServer) -> IdentifierPostExtractor {
        IdentifierPostExtractor::new(
            "datanode",
            build_provider_http_client(Duration::from_secs(5)).unwrap(),
            IdentifierPostConfig {
                endpoint: format!("{}/download", server.uri()),
                ..IdentifierPostConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_posts_id_and_decodes_link() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/download"))
            .and(header("cookie", "lang=german"))
            .and(body_string_contains("id=k3y9"))
            .and(body_string_contains("op=download2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https%3A%2F%2Fdl.test%2Fgame%20v1.rar"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let link = extractor(&server)
            .extract("https://datanodes.to/k3y9/game.rar")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.direct_url, "https://dl.test/game v1.rar");
    }

    #[tokio::test]
    async fn test_reply_without_url_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"error": "gone"})))
            .mount(&server)
            .await;
        let err = extractor(&server)
            .extract("https://datanodes.to/k3y9")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_url_without_id_is_invalid() {
        let server = MockServer::start().await;
        let err = extractor(&server).extract("https://datanodes.to/").await.unwrap_err();
        assert!(matches!(err, ExtractError::InvalidUrl { .. }));
    }
}
