//! Per-scenario world: browsing context, page, API client and scratch data.
//!
//! A [`World`] is built fresh for every scenario and torn down with
//! [`World::destroy`] before the next one starts. Steps reach the application
//! only through the world's HTTP helpers and page, never by building their own
//! clients.

use crate::browser::{self, BrowserEngine, BrowserError, BrowsingContext, Page};
use crate::config::{self, EnvironmentConfig};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use trellis_mocks::{GraphStore, PinStore};

/// Errors raised by world construction and world operations.
#[derive(Debug, Error)]
pub enum WorldError {
    /// The browsing context could not be created.
    #[error("could not acquire browsing context: {0}")]
    Context(#[source] BrowserError),

    /// The page could not be opened (the context was released).
    #[error("could not open page: {0}")]
    Page(#[source] BrowserError),

    /// The HTTP client could not be built.
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// An API call failed before a response arrived (including timeouts).
    #[error("{method} {url} failed: {source}")]
    Request {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Page navigation failed or timed out.
    #[error(transparent)]
    Navigation(BrowserError),

    /// The world was already destroyed.
    #[error("world has been destroyed")]
    Destroyed,

    /// Releasing a resource failed.
    #[error("teardown failed: {0}")]
    Release(#[source] BrowserError),
}

/// A response from the application-under-test.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body, a JSON string for non-JSON bodies, or `null` when empty.
    pub body: Value,
    pub text: String,
}

impl ApiResponse {
    fn from_text(status: u16, text: String) -> Self {
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()))
        };
        Self { status, body, text }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Handles to the suite's running mock adapters.
#[derive(Debug, Clone, Default)]
pub struct MockHandles {
    pub graph: Option<GraphStore>,
    pub pins: Option<PinStore>,
    /// Locally reachable base URL of the inference mock.
    pub inference_url: Option<String>,
}

/// State owned by one scenario.
pub struct World {
    config: Arc<EnvironmentConfig>,
    use_mocks: bool,
    context: Option<Box<dyn BrowsingContext>>,
    page: Option<Box<dyn Page>>,
    client: Option<reqwest::Client>,
    test_data: HashMap<String, Value>,
    mocks: MockHandles,
    last_response: Option<ApiResponse>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("environment", &self.config.name)
            .field("use_mocks", &self.use_mocks)
            .field("live", &self.is_live())
            .field("test_data", &self.test_data)
            .field("last_response", &self.last_response)
            .finish_non_exhaustive()
    }
}

impl World {
    /// Acquires a browsing context, a page in it and an API client.
    ///
    /// A failure after the context exists releases the context before
    /// returning. Construction is never retried.
    pub async fn construct(
        config: Arc<EnvironmentConfig>,
        engine: &dyn BrowserEngine,
        use_mocks: bool,
        mocks: MockHandles,
    ) -> Result<Self, WorldError> {
        let limit = config.timeouts.page;
        let mut context = browser::within(limit, "browsing context creation", engine.new_context())
            .await
            .map_err(WorldError::Context)?;

        let mut page = match browser::within(limit, "page open", context.open_page()).await {
            Ok(page) => page,
            Err(e) => {
                release_context(context.as_mut(), limit).await;
                return Err(WorldError::Page(e));
            }
        };

        let client = match reqwest::Client::builder()
            .timeout(config.timeouts.api)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                if let Err(close_err) = browser::within(limit, "page close", page.close()).await {
                    tracing::warn!("Failed to close page after client error: {}", close_err);
                }
                release_context(context.as_mut(), limit).await;
                return Err(WorldError::Client(e));
            }
        };

        tracing::debug!("World constructed for {} environment", config.name);

        Ok(Self {
            config,
            use_mocks,
            context: Some(context),
            page: Some(page),
            client: Some(client),
            test_data: HashMap::new(),
            mocks,
            last_response: None,
        })
    }

    /// Releases the page, the context and the client.
    ///
    /// Every release is attempted and bounded by the page timeout; the first
    /// failure is returned. Calling `destroy` twice is a no-op.
    pub async fn destroy(&mut self) -> Result<(), WorldError> {
        let limit = self.config.timeouts.page;
        let mut first_error = None;

        if let Some(mut page) = self.page.take()
            && let Err(e) = browser::within(limit, "page close", page.close()).await
        {
            tracing::warn!("Failed to close page: {}", e);
            first_error.get_or_insert(WorldError::Release(e));
        }

        if let Some(mut context) = self.context.take()
            && let Err(e) = browser::within(limit, "browsing context close", context.close()).await
        {
            tracing::warn!("Failed to close browsing context: {}", e);
            first_error.get_or_insert(WorldError::Release(e));
        }

        self.client = None;
        self.test_data.clear();
        self.last_response = None;

        first_error.map_or(Ok(()), Err)
    }

    /// True until [`World::destroy`] has run.
    pub fn is_live(&self) -> bool {
        self.context.is_some() || self.page.is_some() || self.client.is_some()
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// `services[service].mock || use_mocks`.
    pub fn should_mock(&self, service: &str) -> bool {
        self.use_mocks || self.config.is_mocked(service)
    }

    /// Handles to the in-process mocks.
    pub fn mocks(&self) -> &MockHandles {
        &self.mocks
    }

    pub fn test_data(&self) -> &HashMap<String, Value> {
        &self.test_data
    }

    pub fn remember(&mut self, key: impl Into<String>, value: Value) {
        self.test_data.insert(key.into(), value);
    }

    pub fn recall(&self, key: &str) -> Option<&Value> {
        self.test_data.get(key)
    }

    /// The most recent API response, if any call has been made.
    pub fn last_response(&self) -> Option<&ApiResponse> {
        self.last_response.as_ref()
    }

    pub async fn get(&mut self, endpoint: &str) -> Result<ApiResponse, WorldError> {
        self.request(Method::GET, endpoint, None).await
    }

    pub async fn post(
        &mut self,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse, WorldError> {
        self.request(Method::POST, endpoint, body).await
    }

    pub async fn put(
        &mut self,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse, WorldError> {
        self.request(Method::PUT, endpoint, body).await
    }

    pub async fn delete(&mut self, endpoint: &str) -> Result<ApiResponse, WorldError> {
        self.request(Method::DELETE, endpoint, None).await
    }

    /// Sends a request to `{app_url}{endpoint}` and remembers the response.
    ///
    /// Non-2xx statuses are returned as responses, not errors.
    pub async fn request(
        &mut self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse, WorldError> {
        let client = self.client.as_ref().ok_or(WorldError::Destroyed)?;
        let url = self.config.app_endpoint(endpoint);

        let mut builder = client.request(method.clone(), &url);
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let wrap = |source| WorldError::Request {
            method: method.clone(),
            url: url.clone(),
            source,
        };
        let response = builder.send().await.map_err(wrap)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(wrap)?;

        tracing::debug!("{} {} -> {}", method, url, status);

        let api_response = ApiResponse::from_text(status, text);
        self.last_response = Some(api_response.clone());
        Ok(api_response)
    }

    /// Navigates the page to `{app_url}{path}` within the page timeout.
    pub async fn navigate(&mut self, path: &str) -> Result<(), WorldError> {
        let page = self.page.as_ref().ok_or(WorldError::Destroyed)?;
        let url = config::join_url(&self.config.app_url, path);
        let limit = self.config.timeouts.page;

        match tokio::time::timeout(limit, page.goto(&url)).await {
            Ok(result) => result.map_err(WorldError::Navigation),
            Err(_) => Err(WorldError::Navigation(BrowserError::Timeout { url, after: limit })),
        }
    }

    pub async fn current_url(&self) -> Result<String, WorldError> {
        let page = self.page.as_ref().ok_or(WorldError::Destroyed)?;
        browser::within(self.config.timeouts.page, "current URL lookup", page.current_url())
            .await
            .map_err(WorldError::Navigation)
    }

    /// PNG snapshot of the current page, within the page timeout.
    pub async fn screenshot_png(&self) -> Result<Vec<u8>, WorldError> {
        let page = self.page.as_ref().ok_or(WorldError::Destroyed)?;
        browser::within(self.config.timeouts.page, "screenshot", page.screenshot_png())
            .await
            .map_err(WorldError::Navigation)
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if self.context.is_some() || self.page.is_some() {
            tracing::warn!("World dropped without destroy(); browser resources leaked");
        }
    }
}

async fn release_context(context: &mut dyn BrowsingContext, limit: std::time::Duration) {
    if let Err(e) = browser::within(limit, "browsing context close", context.close()).await {
        tracing::warn!("Failed to release browsing context: {}", e);
    }
}
