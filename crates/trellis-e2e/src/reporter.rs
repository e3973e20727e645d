//! Reporters for scenario runs.
//!
//! - `TerminalReporter`: colored progress and summary output
//! - `JsonReporter`: machine-readable report for CI
//! - `ReportWriter`: writes file reports into the artifacts directory
//!
//! Skipped scenarios are always counted on their own line; they never turn a
//! run red.

use crate::models::{ReportFormat, ScenarioReport, StepStatus};
use crate::runner::{ProgressCallback, ProgressEvent, RunResults};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Verbosity level for terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Only the final counts.
    Quiet,
    #[default]
    Normal,
    /// Per-step output and feature headers.
    Verbose,
}

/// Terminal reporter for scenario results.
#[derive(Debug, Default)]
pub struct TerminalReporter {
    verbosity: Verbosity,

    /// Feature of the last started scenario, for grouping headers.
    current_feature: Option<String>,
}

impl TerminalReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbosity(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            current_feature: None,
        }
    }

    /// Handles a progress event, printing appropriate output.
    pub fn handle_progress(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted {
                total_scenarios,
                environment,
            } => {
                if self.verbosity != Verbosity::Quiet {
                    self.print_run_started(total_scenarios, &environment);
                }
            }
            ProgressEvent::ScenarioStarted {
                scenario_id,
                feature,
            } => {
                if self.verbosity == Verbosity::Verbose {
                    self.print_scenario_started(&scenario_id, &feature);
                }
            }
            ProgressEvent::ScenarioCompleted {
                scenario_id,
                passed,
                duration,
                result,
            } => {
                if self.verbosity != Verbosity::Quiet {
                    self.print_scenario_completed(&scenario_id, passed, duration);
                }
                if self.verbosity == Verbosity::Verbose {
                    self.print_steps(&result);
                }
            }
            ProgressEvent::ScenarioSkipped {
                scenario_id,
                reason,
            } => {
                if self.verbosity != Verbosity::Quiet {
                    self.print_scenario_skipped(&scenario_id, &reason);
                }
            }
            ProgressEvent::RunCompleted { results } => {
                // Normal and verbose runs print the summary via print_summary
                if self.verbosity == Verbosity::Quiet {
                    self.print_quiet_summary(&results);
                }
            }
        }
    }

    fn print_run_started(&self, total: usize, environment: &str) {
        println!(
            "\n{} {}",
            format!(
                "Running {} scenario{}",
                total,
                if total == 1 { "" } else { "s" }
            )
            .bold(),
            format!("against {environment}...").dimmed()
        );
        println!();
    }

    fn print_scenario_started(&mut self, scenario_id: &str, feature: &str) {
        if self.current_feature.as_deref() != Some(feature) {
            self.current_feature = Some(feature.to_string());
            println!("{}", feature.bold().underline());
        }

        println!("  {} {}", "▶".dimmed(), scenario_id.dimmed());
        io::stdout().flush().ok();
    }

    fn print_scenario_completed(&self, scenario_id: &str, passed: bool, duration: Duration) {
        let status = if passed { "✅" } else { "❌" };
        let duration_str = format!("({:.1}s)", duration.as_secs_f64()).dimmed();

        println!("  {} {} {}", status, scenario_id, duration_str);
    }

    fn print_steps(&self, result: &ScenarioReport) {
        for step in &result.steps {
            let mark = match step.status {
                StepStatus::Passed => "└─ ✓".green(),
                StepStatus::Failed => "└─ ✗".red(),
                StepStatus::Skipped => "└─ -".dimmed(),
            };
            println!("     {} {}", mark, step.name);
        }
    }

    fn print_scenario_skipped(&self, scenario_id: &str, reason: &str) {
        println!(
            "  {} {} {}",
            "⏭️".dimmed(),
            scenario_id.dimmed(),
            format!("({})", reason).dimmed()
        );
    }

    fn print_quiet_summary(&self, results: &RunResults) {
        let passed = results.passed_count();
        let failed = results.failed_count();
        let executed = results.executed_count();
        let skipped = if results.skipped_count > 0 {
            format!(", {} skipped", results.skipped_count)
        } else {
            String::new()
        };

        if failed == 0 {
            println!(
                "{}",
                format!("✓ {}/{} passed{}", passed, executed, skipped).green()
            );
        } else {
            println!(
                "{}",
                format!("✗ {}/{} failed{}", failed, executed, skipped).red()
            );
        }
    }

    /// Prints the verdict, counts and duration.
    pub fn print_summary(&self, results: &RunResults) {
        println!("\n{}", "━".repeat(40).dimmed());

        let passed = results.passed_count();
        let failed = results.failed_count();
        let skipped = results.skipped_count;
        let executed = results.executed_count();

        let (emoji, verdict, color) = if failed == 0 {
            ("🟢", "PASSED", colored::Color::Green)
        } else if passed > 0 {
            ("🟡", "MIXED", colored::Color::Yellow)
        } else {
            ("🔴", "FAILED", colored::Color::Red)
        };

        let mut parts = vec![];
        if passed > 0 {
            parts.push(format!("{} passed", passed).green().to_string());
        }
        if failed > 0 {
            parts.push(format!("{} failed", failed).red().to_string());
        }
        if skipped > 0 {
            parts.push(format!("{} skipped", skipped).dimmed().to_string());
        }

        let verdict_text = format!("{}: {} of {} scenarios", verdict, passed, executed);
        println!("{} {}", emoji, verdict_text.color(color).bold());
        if !parts.is_empty() {
            println!("   {}", parts.join(", "));
        }

        for warning in &results.warnings {
            println!("   {} {}", "⚠".yellow(), warning.yellow());
        }

        println!(
            "\n   {}",
            format!("Completed in {:.1}s", results.duration.as_secs_f64()).dimmed()
        );
    }

    /// Prints details for failed scenarios.
    pub fn print_failures(&self, results: &RunResults) {
        let failures = results.failures();
        if failures.is_empty() {
            return;
        }

        println!("\n{}", "Failed Scenarios:".red().bold());
        println!();

        for result in failures {
            self.print_failed_scenario(result);
        }
    }

    fn print_failed_scenario(&self, result: &ScenarioReport) {
        println!("  {} {}", "❌".red(), result.scenario_id.red().bold());
        println!("     {}", format!("{}: {}", result.feature, result.name).dimmed());

        if let Some(error) = &result.error {
            println!("     {} {}", "✗".red(), error);
        }
        if let Some(screenshot) = &result.screenshot {
            println!("     Snapshot: {}", screenshot.display().to_string().dimmed());
        }
        for warning in &result.warnings {
            println!("     {} {}", "⚠".yellow(), warning);
        }
        println!();
    }

    /// Prints results grouped by feature.
    pub fn print_by_feature(&self, results: &RunResults) {
        for (feature, reports) in results.by_feature() {
            println!("\n{}", feature.bold().underline());

            for result in reports {
                let status = if result.passed() {
                    "✅"
                } else if result.skipped() {
                    "⏭️"
                } else {
                    "❌"
                };
                let duration = format!("({:.1}s)", result.duration.as_secs_f64()).dimmed();
                println!("  {} {} {}", status, result.scenario_id, duration);

                if self.verbosity == Verbosity::Verbose {
                    self.print_steps(result);
                }
            }
        }
    }
}

/// Creates a progress callback for use with TestRunner.
pub fn create_progress_callback(verbosity: Verbosity) -> ProgressCallback {
    let reporter = Arc::new(Mutex::new(TerminalReporter::with_verbosity(verbosity)));

    Box::new(move |event| {
        if let Ok(mut r) = reporter.lock() {
            r.handle_progress(event);
        }
    })
}

// ============================================================================
// JSON Report
// ============================================================================

/// Errors that can occur during report generation.
#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("failed to write report: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Full run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub timestamp: DateTime<Utc>,

    /// Harness version that produced the report.
    pub trellis_version: String,

    /// Environment the run targeted.
    pub environment: String,

    #[serde(with = "crate::models::duration_serde")]
    pub duration: Duration,

    /// False only when a scenario failed.
    pub passed: bool,

    pub verdict: String,

    pub summary: ReportSummary,

    pub results: Vec<ScenarioReport>,

    /// Suite-level teardown problems.
    pub warnings: Vec<String>,
}

/// Summary statistics for the report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub by_feature: BTreeMap<String, FeatureSummary>,
}

/// Per-feature counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Generates machine-readable JSON reports.
#[derive(Debug, Default)]
pub struct JsonReporter {
    environment: String,
}

impl JsonReporter {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
        }
    }

    pub fn generate(&self, results: &RunResults) -> Result<String, ReporterError> {
        let report = self.build_report(results);
        serde_json::to_string_pretty(&report).map_err(ReporterError::from)
    }

    pub fn build_report(&self, results: &RunResults) -> TestReport {
        let passed = results.all_passed();
        let verdict = if passed {
            if results.skipped_count > 0 {
                format!(
                    "All executed scenarios passed ({} skipped)",
                    results.skipped_count
                )
            } else {
                "All scenarios passed".to_string()
            }
        } else {
            format!("{} scenarios failed", results.failed_count())
        };

        TestReport {
            timestamp: Utc::now(),
            trellis_version: crate::VERSION.to_string(),
            environment: self.environment.clone(),
            duration: results.duration,
            passed,
            verdict,
            summary: build_summary(results),
            results: results.results.clone(),
            warnings: results.warnings.clone(),
        }
    }
}

fn build_summary(results: &RunResults) -> ReportSummary {
    let by_feature = results
        .by_feature()
        .into_iter()
        .map(|(feature, reports)| {
            let summary = FeatureSummary {
                total: reports.len(),
                passed: reports.iter().filter(|r| r.passed()).count(),
                failed: reports.iter().filter(|r| r.failed()).count(),
                skipped: reports.iter().filter(|r| r.skipped()).count(),
            };
            (feature.to_string(), summary)
        })
        .collect();

    ReportSummary {
        total: results.total_count(),
        passed: results.passed_count(),
        failed: results.failed_count(),
        skipped: results.skipped_count,
        by_feature,
    }
}

// ============================================================================
// Report Writer
// ============================================================================

/// Writes file reports.
#[derive(Debug)]
pub struct ReportWriter {
    output_dir: PathBuf,
    environment: String,
}

impl ReportWriter {
    pub fn new(output_dir: PathBuf, environment: impl Into<String>) -> Self {
        Self {
            output_dir,
            environment: environment.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes reports in the requested format. `None` writes nothing.
    pub fn write(
        &self,
        results: &RunResults,
        format: ReportFormat,
    ) -> Result<Vec<PathBuf>, ReporterError> {
        match format {
            ReportFormat::None => Ok(Vec::new()),
            ReportFormat::Json => {
                std::fs::create_dir_all(&self.output_dir)?;
                Ok(vec![self.write_json(results)?])
            }
        }
    }

    /// Writes `report.json`.
    pub fn write_json(&self, results: &RunResults) -> Result<PathBuf, ReporterError> {
        let content = JsonReporter::new(self.environment.clone()).generate(results)?;
        let path = self.output_dir.join("report.json");
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScenarioStatus, StepResult};

    fn report(feature: &str, name: &str, status: ScenarioStatus) -> ScenarioReport {
        ScenarioReport {
            scenario_id: format!("{}/{}", feature.to_lowercase(), name.to_lowercase()),
            name: name.to_string(),
            feature: feature.to_string(),
            tags: vec![],
            status,
            steps: vec![StepResult {
                name: "Given something".to_string(),
                status: match status {
                    ScenarioStatus::Passed => StepStatus::Passed,
                    ScenarioStatus::Failed => StepStatus::Failed,
                    ScenarioStatus::Skipped => StepStatus::Skipped,
                },
                error: None,
            }],
            skip_reason: (status == ScenarioStatus::Skipped).then(|| "unreachable".to_string()),
            error: (status == ScenarioStatus::Failed).then(|| "expected 200, got 500".to_string()),
            screenshot: None,
            warnings: vec![],
            duration: Duration::from_millis(250),
        }
    }

    fn mock_results() -> RunResults {
        RunResults {
            results: vec![
                report("Graph", "create", ScenarioStatus::Passed),
                report("Graph", "search", ScenarioStatus::Skipped),
                report("Chat", "stream", ScenarioStatus::Failed),
            ],
            duration: Duration::from_secs(3),
            skipped_count: 1,
            warnings: vec!["suite stop: provider restore failed".to_string()],
        }
    }

    fn passing_results() -> RunResults {
        RunResults {
            results: vec![
                report("Graph", "create", ScenarioStatus::Passed),
                report("Graph", "search", ScenarioStatus::Skipped),
            ],
            duration: Duration::from_secs(1),
            skipped_count: 1,
            warnings: vec![],
        }
    }

    #[test]
    fn test_verbosity_default() {
        assert_eq!(Verbosity::default(), Verbosity::Normal);
    }

    #[test]
    fn test_handle_progress_all_events() {
        for verbosity in [Verbosity::Quiet, Verbosity::Normal, Verbosity::Verbose] {
            let mut reporter = TerminalReporter::with_verbosity(verbosity);
            reporter.handle_progress(ProgressEvent::RunStarted {
                total_scenarios: 3,
                environment: "ci".to_string(),
            });
            reporter.handle_progress(ProgressEvent::ScenarioStarted {
                scenario_id: "graph/create".to_string(),
                feature: "Graph".to_string(),
            });
            reporter.handle_progress(ProgressEvent::ScenarioCompleted {
                scenario_id: "graph/create".to_string(),
                passed: true,
                duration: Duration::from_millis(250),
                result: report("Graph", "create", ScenarioStatus::Passed),
            });
            reporter.handle_progress(ProgressEvent::ScenarioSkipped {
                scenario_id: "graph/search".to_string(),
                reason: "@requires-neo4j: unreachable".to_string(),
            });
            reporter.handle_progress(ProgressEvent::RunCompleted {
                results: mock_results(),
            });
        }
    }

    #[test]
    fn test_started_tracks_feature() {
        let mut reporter = TerminalReporter::with_verbosity(Verbosity::Verbose);
        reporter.handle_progress(ProgressEvent::ScenarioStarted {
            scenario_id: "chat/stream".to_string(),
            feature: "Chat".to_string(),
        });
        assert_eq!(reporter.current_feature.as_deref(), Some("Chat"));
    }

    #[test]
    fn test_print_summary_and_failures() {
        let reporter = TerminalReporter::new();
        reporter.print_summary(&mock_results());
        reporter.print_failures(&mock_results());
        reporter.print_by_feature(&mock_results());
        reporter.print_failures(&passing_results());
    }

    #[test]
    fn test_create_progress_callback() {
        let callback = create_progress_callback(Verbosity::Quiet);
        callback(ProgressEvent::RunCompleted {
            results: passing_results(),
        });
    }

    #[test]
    fn test_json_report_counts_skips_separately() {
        let report = JsonReporter::new("native").build_report(&passing_results());
        assert!(report.passed);
        assert_eq!(report.environment, "native");
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.summary.skipped, 1);
        assert!(report.verdict.contains("1 skipped"));
        assert_eq!(
            report.summary.by_feature["Graph"],
            FeatureSummary {
                total: 2,
                passed: 1,
                failed: 0,
                skipped: 1
            }
        );
    }

    #[test]
    fn test_json_report_failure_verdict() {
        let json = JsonReporter::new("ci").generate(&mock_results()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["passed"], false);
        assert_eq!(value["verdict"], "1 scenarios failed");
        assert_eq!(value["results"][2]["status"], "failed");
        assert_eq!(value["warnings"][0], "suite stop: provider restore failed");
        assert_eq!(value["trellis_version"], crate::VERSION);
    }

    #[test]
    fn test_report_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("artifacts");
        let writer = ReportWriter::new(out.clone(), "docker");
        assert_eq!(writer.output_dir(), out.as_path());

        let written = writer.write(&mock_results(), ReportFormat::Json).unwrap();
        assert_eq!(written, vec![out.join("report.json")]);

        let parsed: TestReport =
            serde_json::from_str(&std::fs::read_to_string(&written[0]).unwrap()).unwrap();
        assert_eq!(parsed.summary.total, 3);
        assert_eq!(parsed.environment, "docker");
    }

    #[test]
    fn test_report_writer_none_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never");
        let writer = ReportWriter::new(out.clone(), "native");
        assert!(writer.write(&mock_results(), ReportFormat::None).unwrap().is_empty());
        assert!(!out.exists());
    }

    #[test]
    fn test_reporter_error_display() {
        let err = ReporterError::from(std::io::Error::other("disk full"));
        assert!(err.to_string().contains("disk full"));
    }
}
