//! Browser automation seam.
//!
//! The harness needs three things from a browser: one shared engine per
//! suite, a fresh isolated context per scenario, and a page inside that
//! context. [`WebDriverEngine`] provides them over a WebDriver endpoint;
//! [`crate::testing::FakeEngine`] records calls for tests.
//!
//! ```text
//! BrowserEngine ──new_context()──▶ BrowsingContext ──open_page()──▶ Page
//!   (suite)                          (scenario)                    goto / screenshot
//! ```

use async_trait::async_trait;
use std::time::Duration;
use thirtyfour::{ChromeCapabilities, ChromiumLikeCapabilities, DesiredCapabilities, WebDriver};
use thiserror::Error;

/// Errors from the browser layer.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The engine could not be started or reached.
    #[error("browser engine unavailable: {0}")]
    Launch(String),

    /// An operation needed a launched engine.
    #[error("browser engine is not running")]
    NotRunning,

    /// A new isolated context could not be created.
    #[error("failed to create browsing context: {0}")]
    Context(String),

    /// A page could not be opened inside a context.
    #[error("failed to open page: {0}")]
    Page(String),

    /// Navigation failed.
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    /// Navigation did not finish in time.
    #[error("navigation to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    /// Screenshot capture failed.
    #[error("screenshot failed: {0}")]
    Screenshot(String),

    /// Releasing a page, context or engine failed.
    #[error("failed to close {what}: {message}")]
    Close { what: &'static str, message: String },

    /// The browser did not answer within the configured timeout.
    #[error("{operation} did not finish within {after:?}")]
    Unresponsive {
        operation: &'static str,
        after: Duration,
    },
}

/// Awaits `operation`, giving up after `limit`.
pub async fn within<T>(
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, BrowserError>>,
) -> Result<T, BrowserError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrowserError::Unresponsive {
            operation,
            after: limit,
        }),
    }
}

/// The suite-wide browser process.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Starts (or connects to) the engine. Called once at suite start.
    async fn launch(&mut self) -> Result<(), BrowserError>;

    /// Creates a new isolated context. Contexts never share cookies or storage.
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError>;

    /// Shuts the engine down. Closing a closed engine is a no-op.
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// One scenario's isolated browser profile.
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    /// Opens a page in this context.
    async fn open_page(&mut self) -> Result<Box<dyn Page>, BrowserError>;

    /// Releases the context. Idempotent.
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// A single page (tab) driven by steps.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// PNG snapshot of the viewport.
    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError>;

    /// Releases the page. Idempotent.
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Engine backed by a WebDriver server (chromedriver, Selenium, ...).
///
/// Every context is its own WebDriver session, so profiles are isolated by
/// construction. Launching only checks the server's `/status` endpoint.
/// Every call to the server is bounded by the engine's timeout.
#[derive(Debug)]
pub struct WebDriverEngine {
    server_url: String,
    headless: bool,
    timeout: Duration,
    launched: bool,
}

impl WebDriverEngine {
    /// Engine for the WebDriver server at `server_url`, headless by default.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            headless: true,
            timeout: Duration::from_secs(30),
            launched: false,
        }
    }

    /// Bounds the status probe, session creation and session quit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets whether sessions run without a visible window.
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    fn capabilities(&self) -> Result<ChromeCapabilities, BrowserError> {
        let mut caps = DesiredCapabilities::chrome();
        if self.headless {
            caps.set_headless()
                .map_err(|e| BrowserError::Context(e.to_string()))?;
        }
        Ok(caps)
    }
}

#[async_trait]
impl BrowserEngine for WebDriverEngine {
    async fn launch(&mut self) -> Result<(), BrowserError> {
        if self.launched {
            return Ok(());
        }
        let status_url = crate::config::join_url(&self.server_url, "/status");
        let response = reqwest::Client::new()
            .get(&status_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| BrowserError::Launch(format!("{status_url}: {e}")))?;
        if !response.status().is_success() {
            return Err(BrowserError::Launch(format!(
                "{status_url} returned {}",
                response.status()
            )));
        }
        tracing::info!("WebDriver server ready at {}", self.server_url);
        self.launched = true;
        Ok(())
    }

    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError> {
        if !self.launched {
            return Err(BrowserError::NotRunning);
        }
        let caps = self.capabilities()?;
        let server_url = self.server_url.as_str();
        let driver = within(self.timeout, "WebDriver session creation", async move {
            WebDriver::new(server_url, caps)
                .await
                .map_err(|e| BrowserError::Context(e.to_string()))
        })
        .await?;
        Ok(Box::new(WebDriverContext {
            driver: Some(driver),
            timeout: self.timeout,
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if self.launched {
            tracing::info!("Releasing WebDriver server {}", self.server_url);
        }
        self.launched = false;
        Ok(())
    }
}

struct WebDriverContext {
    driver: Option<WebDriver>,
    timeout: Duration,
}

#[async_trait]
impl BrowsingContext for WebDriverContext {
    async fn open_page(&mut self) -> Result<Box<dyn Page>, BrowserError> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| BrowserError::Page("context already closed".to_string()))?;
        Ok(Box::new(WebDriverPage {
            driver: Some(driver.clone()),
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        match self.driver.take() {
            Some(driver) => {
                within(self.timeout, "WebDriver session quit", async move {
                    driver.quit().await.map_err(|e| BrowserError::Close {
                        what: "browsing context",
                        message: e.to_string(),
                    })
                })
                .await
            }
            None => Ok(()),
        }
    }
}

struct WebDriverPage {
    driver: Option<WebDriver>,
}

impl WebDriverPage {
    fn driver(&self) -> Result<&WebDriver, BrowserError> {
        self.driver
            .as_ref()
            .ok_or_else(|| BrowserError::Page("page already closed".to_string()))
    }
}

#[async_trait]
impl Page for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.driver()?
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        self.driver()?
            .current_url()
            .await
            .map(|url| url.to_string())
            .map_err(|e| BrowserError::Page(e.to_string()))
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError> {
        self.driver()?
            .screenshot_as_png()
            .await
            .map_err(|e| BrowserError::Screenshot(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        // The session belongs to the context; dropping our handle is enough.
        self.driver = None;
        Ok(())
    }
}
