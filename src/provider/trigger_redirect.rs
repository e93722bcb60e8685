//! Hosts that hand out the direct link in a redirect header.
//!
//! Protocol: GET the page (sets cookies, registers the visit), then GET
//! `<page>/download` marked as an htmx request. The host answers with an
//! `hx-redirect` header, or a plain `Location` on older deployments.
//!
//! Both requests share one cookie jar per extraction, and the session
//! cookies travel on with the link so the transfer stays in that session.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, LOCATION, REFERER};
use tracing::{debug, instrument};
use url::Url;

use super::html::absolutize_url;
use super::http_client::build_session_clients;
use super::{ExtractError, ProviderExtractor, ResolvedLink};

const TRIGGER_PATH: &str = "download";
const HX_REDIRECT: &str = "hx-redirect";

pub struct TriggerRedirectExtractor {
    key: String,
    timeout: Duration,
}

impl TriggerRedirectExtractor {
    #[must_use]
    pub fn new(key: &str, timeout: Duration) -> Self {
        Self {
            key: key.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ProviderExtractor for TriggerRedirectExtractor {
    fn key(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self), fields(provider = %self.key))]
    async fn extract(&self, url: &str) -> Result<Option<ResolvedLink>, ExtractError> {
        let page_url = url.trim_end_matches('/');
        let base = Url::parse(page_url).map_err(|_| ExtractError::invalid_url(&self.key, url))?;
        let session = build_session_clients(self.timeout)
            .map_err(|e| ExtractError::http(&self.key, page_url, e))?;

        let page = session
            .follow
            .get(page_url)
            .header(REFERER, page_url)
            .send()
            .await
            .map_err(|e| ExtractError::http(&self.key, page_url, e))?;
        if !page.status().is_success() {
            return Err(ExtractError::http_status(
                &self.key,
                page_url,
                page.status().as_u16(),
            ));
        }

        let trigger_url = format!("{page_url}/{TRIGGER_PATH}");
        let response = session
            .no_redirect
            .get(&trigger_url)
            .header("HX-Request", "true")
            .header(REFERER, page_url)
            .send()
            .await
            .map_err(|e| ExtractError::http(&self.key, &trigger_url, e))?;
        debug!(status = response.status().as_u16(), "trigger answered");

        let headers = response.headers();
        let target = headers
            .get(HX_REDIRECT)
            .or_else(|| headers.get(LOCATION))
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ExtractError::extraction_failed(&self.key, "no redirect header on trigger"))?;

        let direct = absolutize_url(target, &base)
            .ok_or_else(|| ExtractError::extraction_failed(&self.key, "unusable redirect target"))?;
        let mut link = ResolvedLink::get(&self.key, direct);
        if let Some(cookies) = session.cookie_header(&base) {
            debug!("carrying page session into the transfer");
            link = link.with_header(COOKIE.as_str(), cookies);
        }
        Ok(Some(link))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn extractor() -> TriggerRedirectExtractor {
        TriggerRedirectExtractor::new("buzzheavier", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_reads_hx_redirect_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/abc/download"))
            .and(header("HX-Request", "true"))
            .respond_with(ResponseTemplate::new(204).insert_header("hx-redirect", "/dl/abc.rar"))
            .mount(&server)
            .await;

        let link = extractor()
            .extract(&format!("{}/abc", server.uri()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.direct_url, format!("{}/dl/abc.rar", server.uri()));
        assert!(link.is_plain_get());
    }

    #[tokio::test]
    async fn test_page_session_reaches_trigger_and_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/abc"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=s1; Path=/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/abc/download"))
            .and(header("cookie", "sid=s1"))
            .respond_with(ResponseTemplate::new(204).insert_header("hx-redirect", "/dl/abc.rar"))
            .mount(&server)
            .await;

        let link = extractor()
            .extract(&format!("{}/abc", server.uri()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.headers.get("cookie").map(String::as_str), Some("sid=s1"));
        assert!(!link.is_plain_get());
    }

    #[tokio::test]
    async fn test_sessions_do_not_leak_between_extractions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/first"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=s1; Path=/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/second"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204).insert_header("hx-redirect", "/dl/file.rar"))
            .mount(&server)
            .await;

        let extractor = extractor();
        extractor.extract(&format!("{}/first", server.uri())).await.unwrap();
        let link = extractor
            .extract(&format!("{}/second", server.uri()))
            .await
            .unwrap()
            .unwrap();
        assert!(link.is_plain_get());
    }

    #[tokio::test]
    async fn test_falls_back_to_location_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xyz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xyz/download"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "https://cdn.test/file.rar"),
            )
            .mount(&server)
            .await;

        let link = extractor()
            .extract(&format!("{}/xyz/", server.uri()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.direct_url, "https://cdn.test/file.rar");
    }

    #[tokio::test]
    async fn test_missing_redirect_is_extraction_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = extractor()
            .extract(&format!("{}/none", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ExtractionFailed { .. }), "{err}");
    }
}
