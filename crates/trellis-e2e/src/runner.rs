//! Scenario runner.
//!
//! The TestRunner drives a [`SuiteContext`] through its lifecycle: it starts
//! the suite, runs every matching scenario strictly in order (guards, steps,
//! teardown) and stops the suite, collecting one [`ScenarioReport`] per
//! scenario.
//!
//! # Example
//!
//! ```no_run
//! use trellis_e2e::{
//!     BuiltinSteps, LaunchOptions, RunConfig, SuiteContext, TestRunner, WebDriverEngine,
//!     config, features,
//! };
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let environment = config::resolve(Some("ci"));
//!     let engine = WebDriverEngine::new(environment.webdriver_url.clone());
//!     let mut suite = SuiteContext::new(LaunchOptions::new(environment), Box::new(engine));
//!
//!     let scenarios = features::load(&[PathBuf::from("features")])?;
//!     let runner = TestRunner::new(scenarios).with_executor(Box::new(BuiltinSteps::new()?));
//!     let results = runner.run(&mut suite, &RunConfig::default()).await?;
//!
//!     println!("Passed: {}", results.passed_count());
//!     Ok(())
//! }
//! ```

use crate::features::ScenarioDecl;
use crate::guards::GuardVerdict;
use crate::hooks::{HarnessError, SuiteContext};
use crate::models::{ScenarioReport, ScenarioStatus, StepResult, StepStatus};
use crate::steps::{self, StepExecutor};
use crate::world::World;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Suite start failed; no scenario ran.
    #[error("suite start failed: {0}")]
    Startup(#[source] HarnessError),

    /// No scenarios matched the filter.
    #[error("no scenarios matched filter: {0}")]
    NoMatchingScenarios(String),
}

/// Configuration for a run.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Case-insensitive substring matched against scenario id, name and feature.
    pub filter: Option<String>,

    /// Only run scenarios carrying every one of these tags.
    pub tags: Vec<String>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Adds a required tag (leading `@` is optional).
    pub fn with_tag(mut self, tag: &str) -> Self {
        let tag = tag.strip_prefix('@').unwrap_or(tag);
        self.tags.push(tag.to_string());
        self
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(filter) = &self.filter {
            parts.push(filter.clone());
        }
        parts.extend(self.tags.iter().map(|t| format!("@{t}")));
        parts.join(" ")
    }
}

/// Aggregated results from a run.
#[derive(Debug, Clone, Default)]
pub struct RunResults {
    /// One report per scenario, skipped ones included.
    pub results: Vec<ScenarioReport>,

    /// Total duration of the run.
    pub duration: Duration,

    /// Number of scenarios skipped by a guard.
    pub skipped_count: usize,

    /// Suite teardown problems. These never fail the run.
    pub warnings: Vec<String>,
}

impl RunResults {
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.failed()).count()
    }

    /// Scenarios that executed (passed or failed).
    pub fn executed_count(&self) -> usize {
        self.passed_count() + self.failed_count()
    }

    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    /// True when nothing failed. Skips never count against a run.
    pub fn all_passed(&self) -> bool {
        !self.results.iter().any(ScenarioReport::failed)
    }

    /// Results grouped by feature, sorted by feature name.
    pub fn by_feature(&self) -> Vec<(&str, Vec<&ScenarioReport>)> {
        let mut features: BTreeMap<&str, Vec<&ScenarioReport>> = BTreeMap::new();
        for result in &self.results {
            features.entry(&result.feature).or_default().push(result);
        }
        features.into_iter().collect()
    }

    pub fn failures(&self) -> Vec<&ScenarioReport> {
        self.results.iter().filter(|r| r.failed()).collect()
    }

    pub fn skips(&self) -> Vec<&ScenarioReport> {
        self.results.iter().filter(|r| r.skipped()).collect()
    }
}

/// Progress callback for run updates.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// Events emitted during a run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The suite is up and scenarios are about to run.
    RunStarted {
        total_scenarios: usize,
        environment: String,
    },

    /// A scenario is about to execute.
    ScenarioStarted { scenario_id: String, feature: String },

    /// A scenario ran to completion (passed or failed).
    ScenarioCompleted {
        scenario_id: String,
        passed: bool,
        duration: Duration,
        result: ScenarioReport,
    },

    /// A guard skipped a scenario.
    ScenarioSkipped { scenario_id: String, reason: String },

    /// The run has completed and the suite is stopped.
    RunCompleted { results: RunResults },
}

/// Runs scenarios against a suite.
pub struct TestRunner {
    scenarios: Vec<ScenarioDecl>,

    /// Consulted in registration order; the first that handles a step runs it.
    executors: Vec<Box<dyn StepExecutor>>,

    on_progress: Option<ProgressCallback>,
}

impl TestRunner {
    pub fn new(scenarios: Vec<ScenarioDecl>) -> Self {
        Self {
            scenarios,
            executors: Vec::new(),
            on_progress: None,
        }
    }

    /// Registers a step executor.
    pub fn with_executor(mut self, executor: Box<dyn StepExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Sets a callback for progress updates.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn scenario_count(&self) -> usize {
        self.scenarios.len()
    }

    /// Returns scenarios matching the given config, in load order.
    pub fn matching_scenarios(&self, config: &RunConfig) -> Vec<&ScenarioDecl> {
        self.scenarios
            .iter()
            .filter(|s| matches_config(s, config))
            .collect()
    }

    /// Starts the suite, runs every matching scenario and stops the suite.
    ///
    /// A failed start returns [`RunnerError::Startup`] without running any
    /// scenario. A failed stop is recorded in [`RunResults::warnings`].
    pub async fn run(
        &self,
        suite: &mut SuiteContext,
        config: &RunConfig,
    ) -> Result<RunResults, RunnerError> {
        let start = Instant::now();
        let matching = self.matching_scenarios(config);

        if matching.is_empty() && (config.filter.is_some() || !config.tags.is_empty()) {
            return Err(RunnerError::NoMatchingScenarios(config.describe()));
        }

        suite.start().await.map_err(RunnerError::Startup)?;

        self.emit_progress(ProgressEvent::RunStarted {
            total_scenarios: matching.len(),
            environment: suite.options().environment.name.to_string(),
        });

        let mut results = Vec::with_capacity(matching.len());
        let mut skipped_count = 0;

        for scenario in matching {
            let report = self.run_scenario(suite, scenario).await;
            if report.skipped() {
                skipped_count += 1;
                self.emit_progress(ProgressEvent::ScenarioSkipped {
                    scenario_id: report.scenario_id.clone(),
                    reason: report.skip_reason.clone().unwrap_or_default(),
                });
            } else {
                self.emit_progress(ProgressEvent::ScenarioCompleted {
                    scenario_id: report.scenario_id.clone(),
                    passed: report.passed(),
                    duration: report.duration,
                    result: report.clone(),
                });
            }
            results.push(report);
        }

        let mut warnings = Vec::new();
        if let Err(e) = suite.stop().await {
            tracing::warn!("Suite stop: {}", e);
            warnings.push(format!("suite stop: {e}"));
        }

        let run_results = RunResults {
            results,
            duration: start.elapsed(),
            skipped_count,
            warnings,
        };

        self.emit_progress(ProgressEvent::RunCompleted {
            results: run_results.clone(),
        });

        Ok(run_results)
    }

    /// Runs one scenario from `ScenarioStarting` back to `Ready`.
    async fn run_scenario(&self, suite: &mut SuiteContext, scenario: &ScenarioDecl) -> ScenarioReport {
        let scenario_id = scenario.id();
        self.emit_progress(ProgressEvent::ScenarioStarted {
            scenario_id: scenario_id.clone(),
            feature: scenario.feature.clone(),
        });

        let scenario_start = Instant::now();
        let mut report = ScenarioReport {
            scenario_id,
            name: scenario.name.clone(),
            feature: scenario.feature.clone(),
            tags: scenario.tags.clone(),
            status: ScenarioStatus::Passed,
            steps: Vec::new(),
            skip_reason: None,
            error: None,
            screenshot: None,
            warnings: Vec::new(),
            duration: Duration::ZERO,
        };

        let mut world = match suite.begin_scenario(scenario).await {
            Ok(world) => world,
            Err(e) => {
                tracing::warn!("Scenario {} could not start: {}", report.scenario_id, e);
                report.status = ScenarioStatus::Failed;
                report.error = Some(e.to_string());
                report.steps = not_run(scenario);
                report.duration = scenario_start.elapsed();
                return report;
            }
        };

        match suite.run_guards(&scenario.tags).await {
            Ok(GuardVerdict::Run) => {
                let (steps, error) = self.execute_steps(scenario, &mut world).await;
                report.steps = steps;
                if let Some(error) = error {
                    report.status = ScenarioStatus::Failed;
                    report.error = Some(error);
                }
            }
            Ok(GuardVerdict::Skip { guard, reason }) => {
                report.status = ScenarioStatus::Skipped;
                report.skip_reason = Some(format!("{guard}: {reason}"));
                report.steps = not_run(scenario);
            }
            Err(e) => {
                report.status = ScenarioStatus::Failed;
                report.error = Some(e.to_string());
                report.steps = not_run(scenario);
            }
        }

        match suite.end_scenario(world, scenario, report.failed()).await {
            Ok(teardown) => {
                report.screenshot = teardown.screenshot;
                report.warnings = teardown.warnings;
            }
            Err(e) => {
                tracing::warn!("Scenario {} teardown: {}", report.scenario_id, e);
                report.warnings.push(e.to_string());
            }
        }

        report.duration = scenario_start.elapsed();
        report
    }

    /// Runs steps in order; after the first failure the rest are skipped.
    async fn execute_steps(
        &self,
        scenario: &ScenarioDecl,
        world: &mut World,
    ) -> (Vec<StepResult>, Option<String>) {
        let mut results = Vec::with_capacity(scenario.steps.len());
        let mut first_error: Option<String> = None;

        for step in &scenario.steps {
            let name = format!("{} {}", step.keyword, step.text);
            if first_error.is_some() {
                results.push(StepResult {
                    name,
                    status: StepStatus::Skipped,
                    error: None,
                });
                continue;
            }

            match steps::dispatch(&self.executors, step, world).await {
                Ok(()) => results.push(StepResult {
                    name,
                    status: StepStatus::Passed,
                    error: None,
                }),
                Err(e) => {
                    tracing::debug!("Step failed: {}: {}", name, e);
                    let message = e.to_string();
                    first_error = Some(format!("{name}: {message}"));
                    results.push(StepResult {
                        name,
                        status: StepStatus::Failed,
                        error: Some(message),
                    });
                }
            }
        }

        (results, first_error)
    }

    fn emit_progress(&self, event: ProgressEvent) {
        if let Some(callback) = &self.on_progress {
            callback(event);
        }
    }
}

fn not_run(scenario: &ScenarioDecl) -> Vec<StepResult> {
    scenario
        .steps
        .iter()
        .map(|step| StepResult {
            name: format!("{} {}", step.keyword, step.text),
            status: StepStatus::Skipped,
            error: None,
        })
        .collect()
}

fn matches_config(scenario: &ScenarioDecl, config: &RunConfig) -> bool {
    if !config.tags.iter().all(|tag| scenario.has_tag(tag)) {
        return false;
    }

    if let Some(filter) = &config.filter {
        let filter_lower = filter.to_lowercase();
        let id_matches = scenario.id().contains(&filter_lower);
        let name_matches = scenario.name.to_lowercase().contains(&filter_lower);
        let feature_matches = scenario.feature.to_lowercase().contains(&filter_lower);

        if !id_matches && !name_matches && !feature_matches {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvironmentConfig, EnvironmentName, LaunchOptions};
    use crate::features::StepDecl;
    use crate::steps::BuiltinSteps;
    use crate::testing::FakeEngine;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    fn scenario(feature: &str, name: &str, tags: &[&str], steps: &[&str]) -> ScenarioDecl {
        ScenarioDecl {
            feature: feature.to_string(),
            name: name.to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            steps: steps.iter().map(|s| StepDecl::new("Given", s)).collect(),
            source: None,
        }
    }

    fn suite(dir: &Path, engine: &FakeEngine) -> SuiteContext {
        let mut config = EnvironmentConfig::declared(EnvironmentName::Native);
        for descriptor in config.services.values_mut() {
            descriptor.locator = "http://127.0.0.1:9".to_string();
        }
        config.app_url = "http://127.0.0.1:9".to_string();
        config.timeouts.api = Duration::from_millis(500);
        let options = LaunchOptions::new(Arc::new(config)).with_artifacts_dir(dir);
        SuiteContext::new(options, Box::new(engine.clone()))
    }

    fn runner(scenarios: Vec<ScenarioDecl>) -> TestRunner {
        TestRunner::new(scenarios).with_executor(Box::new(BuiltinSteps::new().unwrap()))
    }

    #[test]
    fn test_run_config_builder() {
        let config = RunConfig::new().with_filter("graph").with_tag("@smoke");
        assert_eq!(config.filter, Some("graph".to_string()));
        assert_eq!(config.tags, vec!["smoke"]);
        assert_eq!(config.describe(), "graph @smoke");
    }

    #[test]
    fn test_matching_by_filter_and_tags() {
        let runner = TestRunner::new(vec![
            scenario("Graph", "Create node", &["smoke"], &[]),
            scenario("Graph", "Delete node", &[], &[]),
            scenario("Chat", "Stream reply", &["smoke"], &[]),
        ]);

        assert_eq!(runner.scenario_count(), 3);
        assert_eq!(runner.matching_scenarios(&RunConfig::default()).len(), 3);
        assert_eq!(
            runner
                .matching_scenarios(&RunConfig::new().with_filter("GRAPH"))
                .len(),
            2
        );
        let smoke_graph = runner.matching_scenarios(&RunConfig::new().with_filter("graph").with_tag("smoke"));
        assert_eq!(smoke_graph.len(), 1);
        assert_eq!(smoke_graph[0].name, "Create node");
    }

    #[test]
    fn test_run_results_counts() {
        let report = |status| ScenarioReport {
            scenario_id: "f/s".to_string(),
            name: "s".to_string(),
            feature: "f".to_string(),
            tags: vec![],
            status,
            steps: vec![],
            skip_reason: None,
            error: None,
            screenshot: None,
            warnings: vec![],
            duration: Duration::ZERO,
        };
        let results = RunResults {
            results: vec![
                report(ScenarioStatus::Passed),
                report(ScenarioStatus::Skipped),
            ],
            skipped_count: 1,
            ..Default::default()
        };
        assert_eq!(results.passed_count(), 1);
        assert_eq!(results.failed_count(), 0);
        assert_eq!(results.executed_count(), 1);
        assert!(results.all_passed());
        assert_eq!(results.skips().len(), 1);
        assert_eq!(results.by_feature().len(), 1);
    }

    #[tokio::test]
    async fn test_no_matching_scenarios_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let mut suite = suite(dir.path(), &engine);
        let runner = runner(vec![scenario("Graph", "Create", &[], &[])]);

        let err = runner
            .run(&mut suite, &RunConfig::new().with_filter("nothing"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NoMatchingScenarios(_)));
        assert_eq!(engine.log().launches, 0);
    }

    #[tokio::test]
    async fn test_failed_step_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let mut suite = suite(dir.path(), &engine);
        let runner = runner(vec![scenario(
            "Data",
            "Broken",
            &[],
            &[
                r#"I set "a" to "1""#,
                "this step does not exist",
                r#"I set "b" to "2""#,
            ],
        )]);

        let results = runner.run(&mut suite, &RunConfig::default()).await.unwrap();
        let report = &results.results[0];
        assert!(report.failed());
        assert_eq!(
            report.steps.iter().map(|s| s.status).collect::<Vec<_>>(),
            vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped]
        );
        assert!(report.error.as_deref().unwrap().contains("undefined step"));
        assert!(report.screenshot.is_some());
        assert!(!results.all_passed());
    }

    #[tokio::test]
    async fn test_progress_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FakeEngine::new();
        let mut suite = suite(dir.path(), &engine);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let runner = runner(vec![
            scenario("Data", "Ok", &[], &[r#"I set "a" to "1""#]),
            scenario("Graph", "Needs neo4j", &["requires-neo4j"], &[]),
        ])
        .on_progress(Box::new(move |event| {
            let label = match event {
                ProgressEvent::RunStarted { .. } => "run-started",
                ProgressEvent::ScenarioStarted { .. } => "started",
                ProgressEvent::ScenarioCompleted { .. } => "completed",
                ProgressEvent::ScenarioSkipped { .. } => "skipped",
                ProgressEvent::RunCompleted { .. } => "run-completed",
            };
            sink.lock().unwrap().push(label);
        }));

        let results = runner.run(&mut suite, &RunConfig::default()).await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "run-started",
                "started",
                "completed",
                "started",
                "skipped",
                "run-completed"
            ]
        );
        assert_eq!(results.skipped_count, 1);
        assert!(results.all_passed());
        assert_eq!(engine.log().open_contexts(), 0);
    }
}
