//! Suite and scenario lifecycle hooks.
//!
//! [`SuiteContext`] owns everything that outlives a single scenario: the
//! browser engine, the mock adapters and the snapshot of the application's
//! inference-provider settings. Hooks are methods on it and must be called in
//! order; anything else returns [`HarnessError::InvalidPhase`].
//!
//! ```text
//! Idle ─start()─▶ Starting ─▶ Ready ─begin_scenario()─▶ ScenarioStarting
//!  ▲                           ▲  │                         │ run_guards()
//!  │                           │  │                         ▼
//!  │                           └──┼──end_scenario()── ScenarioRunning
//!  └──────── Stopping ◀─stop()────┘
//! ```

use crate::browser::{self, BrowserEngine, BrowserError};
use crate::config::{IPFS, LMSTUDIO, LaunchOptions, NEO4J};
use crate::features::{ScenarioDecl, slug};
use crate::guards::{self, GuardContext, GuardVerdict};
use crate::world::{MockHandles, World, WorldError};
use serde_json::Value;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use trellis_mocks::{
    GraphMock, InferenceMock, InferenceSettings, MockAdapter, MockError, MockKind, PinningMock,
};

/// Application endpoint holding the inference-provider settings.
pub const PROVIDER_ENDPOINT: &str = "/api/admin/inference-provider";

/// Tag that resets every mock adapter before the scenario starts.
pub const ISOLATED_TAG: &str = "isolated";

/// Where the suite is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuitePhase {
    Idle,
    Starting,
    Ready,
    ScenarioStarting,
    ScenarioRunning,
    ScenarioEnding,
    Stopping,
}

impl fmt::Display for SuitePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SuitePhase::Idle => "idle",
            SuitePhase::Starting => "starting",
            SuitePhase::Ready => "ready",
            SuitePhase::ScenarioStarting => "starting a scenario",
            SuitePhase::ScenarioRunning => "running a scenario",
            SuitePhase::ScenarioEnding => "ending a scenario",
            SuitePhase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Errors raised by lifecycle hooks.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A hook was called out of order.
    #[error("cannot {operation} while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: SuitePhase,
    },

    /// The shared browser engine failed to launch or close.
    #[error("browser engine: {0}")]
    Browser(#[from] BrowserError),

    /// A scenario's world could not be built.
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisition(#[from] WorldError),

    /// A mock adapter failed to start.
    #[error("mock startup failed: {0}")]
    MockStartup(#[from] MockError),

    /// A mock adapter failed to stop, or did not stop in time.
    #[error("mock shutdown failed: {0}")]
    MockShutdown(MockError),

    /// A started adapter did not accept connections in time.
    #[error("{kind} mock at {addr} not accepting connections within {timeout:?}")]
    MockNotReady {
        kind: MockKind,
        addr: SocketAddr,
        timeout: Duration,
    },

    /// Reading, replacing or restoring the provider settings failed.
    #[error("inference provider reconfiguration failed: {0}")]
    Reconfigure(String),
}

/// What scenario teardown produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioTeardown {
    /// Snapshot written for a failed scenario.
    pub screenshot: Option<PathBuf>,
    /// Problems that did not change the scenario outcome.
    pub warnings: Vec<String>,
}

/// The service each adapter kind stands in for.
pub fn service_for(kind: MockKind) -> &'static str {
    match kind {
        MockKind::Inference => LMSTUDIO,
        MockKind::Graph => NEO4J,
        MockKind::Pinning => IPFS,
    }
}

/// Address to dial for a listener bound to `addr` (wildcard binds dial loopback).
fn dial_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

/// Suite-wide state, passed by `&mut` to every hook.
pub struct SuiteContext {
    options: LaunchOptions,
    phase: SuitePhase,
    engine: Box<dyn BrowserEngine>,
    inference: Option<InferenceMock>,
    graph: Option<GraphMock>,
    pinning: Option<PinningMock>,
    handles: MockHandles,
    provider_snapshot: Option<Value>,
    provider_overridden: bool,
    client: reqwest::Client,
}

impl fmt::Debug for SuiteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteContext")
            .field("environment", &self.options.environment.name)
            .field("use_mocks", &self.options.use_mocks)
            .field("phase", &self.phase)
            .field("handles", &self.handles)
            .field("provider_overridden", &self.provider_overridden)
            .finish_non_exhaustive()
    }
}

impl SuiteContext {
    /// Creates an idle context. Nothing is launched until [`SuiteContext::start`].
    pub fn new(options: LaunchOptions, engine: Box<dyn BrowserEngine>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(options.environment.timeouts.api)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            options,
            phase: SuitePhase::Idle,
            engine,
            inference: None,
            graph: None,
            pinning: None,
            handles: MockHandles::default(),
            provider_snapshot: None,
            provider_overridden: false,
            client,
        }
    }

    pub fn phase(&self) -> SuitePhase {
        self.phase
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Handles to the running adapters (empty before start).
    pub fn mock_handles(&self) -> &MockHandles {
        &self.handles
    }

    /// The inference mock, when started.
    pub fn inference_mock(&self) -> Option<&InferenceMock> {
        self.inference.as_ref()
    }

    /// `services[service].mock || use_mocks`.
    pub fn should_mock(&self, service: &str) -> bool {
        self.options.should_mock(service)
    }

    fn expect_phase(&self, operation: &'static str, allowed: &[SuitePhase]) -> Result<(), HarnessError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(HarnessError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn adapters(&self) -> Vec<&dyn MockAdapter> {
        let mut adapters: Vec<&dyn MockAdapter> = Vec::new();
        if let Some(m) = &self.inference {
            adapters.push(m);
        }
        if let Some(m) = &self.graph {
            adapters.push(m);
        }
        if let Some(m) = &self.pinning {
            adapters.push(m);
        }
        adapters
    }

    fn adapters_mut(&mut self) -> Vec<&mut dyn MockAdapter> {
        let mut adapters: Vec<&mut dyn MockAdapter> = Vec::new();
        if let Some(m) = &mut self.inference {
            adapters.push(m);
        }
        if let Some(m) = &mut self.graph {
            adapters.push(m);
        }
        if let Some(m) = &mut self.pinning {
            adapters.push(m);
        }
        adapters
    }

    /// Launches the engine, starts required adapters, points the application
    /// at the inference mock and waits for adapters to accept connections.
    ///
    /// Any failure undoes the partial start and leaves the context idle.
    pub async fn start(&mut self) -> Result<(), HarnessError> {
        self.expect_phase("start the suite", &[SuitePhase::Idle])?;
        self.phase = SuitePhase::Starting;
        tracing::info!(
            "Starting suite for {} environment (use_mocks={})",
            self.options.environment.name,
            self.options.use_mocks
        );

        if let Err(e) = self.start_inner().await {
            tracing::warn!("Suite start failed: {}", e);
            self.abort_start().await;
            self.phase = SuitePhase::Idle;
            return Err(e);
        }

        self.phase = SuitePhase::Ready;
        tracing::info!("Suite ready");
        Ok(())
    }

    async fn start_inner(&mut self) -> Result<(), HarnessError> {
        let limit = self.options.environment.timeouts.page;
        browser::within(limit, "browser launch", self.engine.launch()).await?;

        let bind = SocketAddr::new(self.options.environment.mocks.bind, 0);
        for kind in MockKind::all() {
            if !self.should_mock(service_for(*kind)) {
                continue;
            }
            self.start_adapter(*kind, bind).await?;
        }

        if let Some(addr) = self.inference.as_ref().and_then(|m| m.local_addr()) {
            self.snapshot_provider().await?;
            let advertised = self.options.environment.mocks.advertised_url(addr.port());
            self.override_provider(&advertised).await?;
        }

        self.wait_until_ready().await
    }

    async fn start_adapter(&mut self, kind: MockKind, bind: SocketAddr) -> Result<(), HarnessError> {
        match kind {
            MockKind::Inference => {
                let mut mock = InferenceMock::new(InferenceSettings {
                    chunk_delay: self.options.chunk_delay(),
                });
                let addr = mock.start(bind).await?;
                self.handles.inference_url = Some(format!("http://{}", dial_addr(addr)));
                self.inference = Some(mock);
            }
            MockKind::Graph => {
                let mut mock = GraphMock::new();
                mock.start(bind).await?;
                self.handles.graph = Some(mock.store());
                self.graph = Some(mock);
            }
            MockKind::Pinning => {
                let mut mock = PinningMock::default();
                mock.start(bind).await?;
                self.handles.pins = Some(mock.store());
                self.pinning = Some(mock);
            }
        }
        tracing::info!("{} mock standing in for {}", kind, service_for(kind));
        Ok(())
    }

    async fn snapshot_provider(&mut self) -> Result<(), HarnessError> {
        let url = self.options.environment.app_endpoint(PROVIDER_ENDPOINT);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HarnessError::Reconfigure(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(HarnessError::Reconfigure(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let snapshot: Value = response
            .json()
            .await
            .map_err(|e| HarnessError::Reconfigure(format!("GET {url}: {e}")))?;
        if !snapshot.is_object() {
            return Err(HarnessError::Reconfigure(format!(
                "GET {url} did not return an object"
            )));
        }
        tracing::debug!("Snapshotted inference provider settings");
        self.provider_snapshot = Some(snapshot);
        Ok(())
    }

    async fn put_provider(&self, body: &Value) -> Result<(), HarnessError> {
        let url = self.options.environment.app_endpoint(PROVIDER_ENDPOINT);
        let response = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| HarnessError::Reconfigure(format!("PUT {url}: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(HarnessError::Reconfigure(format!(
                "PUT {url} returned {}",
                response.status()
            )))
        }
    }

    async fn override_provider(&mut self, base_url: &str) -> Result<(), HarnessError> {
        let mut body = self
            .provider_snapshot
            .clone()
            .ok_or_else(|| HarnessError::Reconfigure("no snapshot taken".to_string()))?;
        if let Some(map) = body.as_object_mut() {
            map.insert("baseUrl".to_string(), Value::String(base_url.to_string()));
        }
        self.put_provider(&body).await?;
        self.provider_overridden = true;
        tracing::info!("Application inference provider pointed at {}", base_url);
        Ok(())
    }

    async fn restore_provider(&mut self) -> Result<(), HarnessError> {
        let snapshot = self.provider_snapshot.take();
        if !std::mem::take(&mut self.provider_overridden) {
            return Ok(());
        }
        match snapshot {
            Some(snapshot) => {
                self.put_provider(&snapshot).await?;
                tracing::info!("Application inference provider restored");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn wait_until_ready(&self) -> Result<(), HarnessError> {
        let timeout = self.options.environment.timeouts.api;
        for adapter in self.adapters() {
            let Some(addr) = adapter.local_addr() else {
                continue;
            };
            let target = dial_addr(addr);
            match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
                Ok(Ok(_)) => tracing::debug!("{} mock accepting connections", adapter.kind()),
                _ => {
                    return Err(HarnessError::MockNotReady {
                        kind: adapter.kind(),
                        addr: target,
                        timeout,
                    });
                }
            }
        }
        Ok(())
    }

    async fn stop_adapters(&mut self) -> Result<(), HarnessError> {
        let limit = self.options.environment.timeouts.api;
        let mut first_error = None;
        for adapter in self.adapters_mut() {
            let kind = adapter.kind();
            let stopped = match tokio::time::timeout(limit, adapter.stop()).await {
                Ok(result) => result,
                Err(_) => Err(MockError::Shutdown {
                    kind,
                    message: format!("did not stop within {limit:?}"),
                }),
            };
            if let Err(e) = stopped {
                tracing::warn!("Failed to stop {} mock: {}", kind, e);
                first_error.get_or_insert(HarnessError::MockShutdown(e));
            }
        }
        self.inference = None;
        self.graph = None;
        self.pinning = None;
        self.handles = MockHandles::default();
        first_error.map_or(Ok(()), Err)
    }

    async fn abort_start(&mut self) {
        if let Err(e) = self.stop_adapters().await {
            tracing::warn!("Cleanup after failed start: {}", e);
        }
        if let Err(e) = self.restore_provider().await {
            tracing::warn!("Cleanup after failed start: {}", e);
        }
        let limit = self.options.environment.timeouts.page;
        if let Err(e) = browser::within(limit, "browser close", self.engine.close()).await {
            tracing::warn!("Cleanup after failed start: {}", e);
        }
    }

    /// Clears the state of every running adapter.
    pub fn reset_mocks(&self) {
        for adapter in self.adapters() {
            adapter.reset();
            tracing::debug!("{} mock reset", adapter.kind());
        }
    }

    /// Builds a fresh world for `scenario`, resetting mocks first when the
    /// scenario is tagged `@isolated`.
    pub async fn begin_scenario(&mut self, scenario: &ScenarioDecl) -> Result<World, HarnessError> {
        self.expect_phase("begin a scenario", &[SuitePhase::Ready])?;
        self.phase = SuitePhase::ScenarioStarting;
        tracing::debug!("Scenario starting: {}", scenario.id());

        if scenario.has_tag(ISOLATED_TAG) {
            self.reset_mocks();
        }

        match World::construct(
            self.options.environment.clone(),
            self.engine.as_ref(),
            self.options.use_mocks,
            self.handles.clone(),
        )
        .await
        {
            Ok(world) => Ok(world),
            Err(e) => {
                self.phase = SuitePhase::Ready;
                Err(HarnessError::ResourceAcquisition(e))
            }
        }
    }

    /// Runs the tag guards for the scenario that is starting.
    pub async fn run_guards(&mut self, tags: &[String]) -> Result<GuardVerdict, HarnessError> {
        self.expect_phase("run guards", &[SuitePhase::ScenarioStarting])?;
        self.phase = SuitePhase::ScenarioRunning;
        let ctx = GuardContext {
            config: &self.options.environment,
            use_mocks: self.options.use_mocks,
            client: &self.client,
        };
        Ok(guards::evaluate_tags(tags, &ctx).await)
    }

    /// Captures a snapshot if the scenario failed, then destroys the world.
    ///
    /// Teardown problems are logged and returned as warnings; they never
    /// change the scenario's outcome.
    pub async fn end_scenario(
        &mut self,
        mut world: World,
        scenario: &ScenarioDecl,
        failed: bool,
    ) -> Result<ScenarioTeardown, HarnessError> {
        self.expect_phase(
            "end a scenario",
            &[SuitePhase::ScenarioStarting, SuitePhase::ScenarioRunning],
        )?;
        self.phase = SuitePhase::ScenarioEnding;
        let mut teardown = ScenarioTeardown::default();

        if failed {
            match capture_screenshot(&world, &self.options.artifacts_dir, &scenario.id()).await {
                Ok(path) => {
                    tracing::info!("Failure snapshot saved to {}", path.display());
                    teardown.screenshot = Some(path);
                }
                Err(message) => {
                    tracing::warn!("{}", message);
                    teardown.warnings.push(message);
                }
            }
        }

        if let Err(e) = world.destroy().await {
            tracing::warn!("Scenario teardown: {}", e);
            teardown.warnings.push(format!("teardown: {e}"));
        }

        self.phase = SuitePhase::Ready;
        Ok(teardown)
    }

    /// Stops adapters, restores provider settings and closes the engine.
    /// All three are attempted; the first error is returned.
    pub async fn stop(&mut self) -> Result<(), HarnessError> {
        self.expect_phase("stop the suite", &[SuitePhase::Ready])?;
        self.phase = SuitePhase::Stopping;
        tracing::info!("Stopping suite");

        let mut first_error = None;
        if let Err(e) = self.stop_adapters().await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.restore_provider().await {
            tracing::warn!("{}", e);
            first_error.get_or_insert(e);
        }
        let limit = self.options.environment.timeouts.page;
        if let Err(e) = browser::within(limit, "browser close", self.engine.close()).await {
            tracing::warn!("Failed to close browser engine: {}", e);
            first_error.get_or_insert(HarnessError::Browser(e));
        }

        self.phase = SuitePhase::Idle;
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for SuiteContext {
    fn drop(&mut self) {
        if self.phase != SuitePhase::Idle {
            tracing::warn!("Suite context dropped while {}; adapters aborted", self.phase);
        }
    }
}

async fn capture_screenshot(world: &World, dir: &Path, scenario_id: &str) -> Result<PathBuf, String> {
    let png = world
        .screenshot_png()
        .await
        .map_err(|e| format!("screenshot capture failed: {e}"))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    let path = dir.join(format!("{}-{}.png", slug(scenario_id), stamp));
    tokio::fs::write(&path, png)
        .await
        .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
    Ok(path)
}
