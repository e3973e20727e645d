//! # trellis-e2e
//!
//! Environment-aware scenario harness. One suite of Gherkin scenarios runs
//! unmodified against a locally-run application (`native`), a containerized
//! stack (`docker`) or a CI stack (`ci`). The harness resolves per-target
//! configuration, stands in-process mocks in for external services the target
//! declares mocked, and skips scenarios whose live dependencies are down.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  TestRunner │────▶│ SuiteContext │────▶│ MockAdapter │  (trellis-mocks)
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        │                   │
//!        │                   ├──▶ BrowserEngine (shared)
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Reporter   │     │    World    │◀────│ StepExecutor│
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - `config`: static environment registry and launch options
//! - `browser`: browser seam and the WebDriver implementation
//! - `world`: per-scenario state (browsing context, page, API client, test data)
//! - `guards`: `@requires-*` tag guards
//! - `hooks`: suite and scenario lifecycle state machine
//! - `features`: `.feature` loading
//! - `steps`: step executor seam and built-in steps
//! - `runner`: sequential scenario execution
//! - `reporter`: terminal and JSON reports
//! - `testing`: fake browser engine for tests

pub use crate::browser::{BrowserEngine, BrowserError, BrowsingContext, Page, WebDriverEngine};
pub use crate::config::{
    ConfigError, Credentials, EnvironmentConfig, EnvironmentName, LaunchOptions, MockSettings,
    ServiceDescriptor, Timeouts,
};
pub use crate::features::{FeatureError, ScenarioDecl, StepDecl};
pub use crate::guards::{GuardKind, GuardVerdict};
pub use crate::hooks::{HarnessError, ScenarioTeardown, SuiteContext, SuitePhase};
pub use crate::models::{ReportFormat, ScenarioReport, ScenarioStatus, StepResult, StepStatus};
pub use crate::reporter::{
    FeatureSummary, JsonReporter, ReportSummary, ReportWriter, ReporterError, TerminalReporter,
    TestReport, Verbosity, create_progress_callback,
};
pub use crate::runner::{
    ProgressCallback, ProgressEvent, RunConfig, RunResults, RunnerError, TestRunner,
};
pub use crate::steps::{BuiltinSteps, StepError, StepExecutor};
pub use crate::world::{ApiResponse, MockHandles, World, WorldError};

pub mod browser;
pub mod config;
pub mod features;
pub mod guards;
pub mod hooks;
mod models;
pub mod reporter;
pub mod runner;
pub mod steps;
pub mod testing;
pub mod world;

/// Harness version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
