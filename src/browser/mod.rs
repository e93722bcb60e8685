//! Injected page-rendering and browser-session capabilities.
//!
//! The core never drives a browser directly. Hosts that need one depend on
//! [`BrowserDriver`]; site resolvers depend on [`PageRenderer`]. Both are
//! traits so tests substitute scripted stubs.
//!
//! - [`HttpPageRenderer`] - plain HTTP fetch, no script execution
//! - [`BrowserPageRenderer`] - renders through a [`BrowserDriver`]
//! - [`RenderQueue`] - serializes any renderer through a single worker

mod http_renderer;
mod queue;

pub use http_renderer::HttpPageRenderer;
pub use queue::{RenderQueue, RenderQueueConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors surfaced by renderers and browser sessions.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("render of {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("render queue is not started")]
    NotStarted,

    #[error("operation not supported by this renderer: {operation}")]
    Unsupported { operation: String },

    #[error("element {locator} not interactable within {wait:?}")]
    ElementUnavailable { locator: String, wait: Duration },

    #[error("fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },
}

impl RenderError {
    pub fn fetch(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }
}

/// How a browser session finds an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementLocator {
    Id(String),
    XPath(String),
    /// Visible text of a button or link.
    Text(String),
}

impl std::fmt::Display for ElementLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::XPath(path) => write!(f, "xpath:{path}"),
            Self::Text(text) => write!(f, "text:'{text}'"),
        }
    }
}

/// One step of a scripted page interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionStep {
    /// Click once the element is interactable, waiting at most `wait`.
    Click { locator: ElementLocator, wait: Duration },
    /// Attempt to dismiss a checkbox challenge; failure is ignored.
    DismissChallenge { wait: Duration },
    Sleep(Duration),
}

/// Direction of an observed network event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEventKind {
    Request,
    Response,
}

/// Traffic the browser itself produced, as reported by its performance log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub url: String,
    pub kind: NetworkEventKind,
    /// Response body, when the driver captured it.
    pub body: Option<String>,
}

impl NetworkEvent {
    #[must_use]
    pub fn request(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: NetworkEventKind::Request,
            body: None,
        }
    }

    #[must_use]
    pub fn response(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: NetworkEventKind::Response,
            body: Some(body.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
}

/// Starts browser sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Opens a fresh session.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError`] when no browser can be started.
    async fn open(&self) -> Result<Box<dyn BrowserSession>, RenderError>;
}

/// A live browser tab.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError>;

    /// Clicks the element once it becomes interactable, waiting at most `wait`.
    async fn click(&mut self, locator: &ElementLocator, wait: Duration) -> Result<(), RenderError>;

    /// Best-effort checkbox challenge dismissal.
    async fn solve_checkbox_challenge(&mut self, wait: Duration) -> Result<(), RenderError>;

    /// Returns and clears network events recorded since the previous drain.
    async fn drain_network_events(&mut self) -> Result<Vec<NetworkEvent>, RenderError>;

    async fn cookies(&mut self) -> Result<Vec<BrowserCookie>, RenderError>;

    async fn page_source(&mut self) -> Result<String, RenderError>;

    async fn close(&mut self);
}

/// Produces HTML for a page.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Returns the page HTML after load.
    async fn render(&self, url: &str) -> Result<String, RenderError>;

    /// Returns the page HTML after running `steps`.
    async fn render_and_interact(
        &self,
        url: &str,
        steps: &[InteractionStep],
    ) -> Result<String, RenderError>;
}

/// Renders pages through a browser driver.
pub struct BrowserPageRenderer {
    driver: std::sync::Arc<dyn BrowserDriver>,
}

impl BrowserPageRenderer {
    #[must_use]
    pub fn new(driver: std::sync::Arc<dyn BrowserDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl PageRenderer for BrowserPageRenderer {
    async fn render(&self, url: &str) -> Result<String, RenderError> {
        self.render_and_interact(url, &[]).await
    }

    #[instrument(skip(self, steps), fields(url = %url, steps = steps.len()))]
    async fn render_and_interact(
        &self,
        url: &str,
        steps: &[InteractionStep],
    ) -> Result<String, RenderError> {
        let mut session = self.driver.open().await?;
        let outcome = run_steps(session.as_mut(), url, steps).await;
        session.close().await;
        outcome
    }
}

async fn run_steps(
    session: &mut dyn BrowserSession,
    url: &str,
    steps: &[InteractionStep],
) -> Result<String, RenderError> {
    session.navigate(url).await?;
    for step in steps {
        match step {
            InteractionStep::Click { locator, wait } => session.click(locator, *wait).await?,
            InteractionStep::DismissChallenge { wait } => {
                if let Err(error) = session.solve_checkbox_challenge(*wait).await {
                    debug!(error = %error, "challenge dismissal skipped");
                }
            }
            InteractionStep::Sleep(duration) => tokio::time::sleep(*duration).await,
        }
    }
    session.page_source().await.inspect_err(|error| {
        warn!(error = %error, "page source unavailable after interaction");
    })
}
