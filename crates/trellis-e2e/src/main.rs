//! # trellis-e2e
//!
//! Runs a Gherkin suite against one execution target.
//!
//! ## Usage
//!
//! ```bash
//! # Run every scenario under ./features against a local stack
//! trellis-e2e
//!
//! # CI stack, all external services mocked
//! TEST_ENV=ci USE_MOCKS=true trellis-e2e features/
//!
//! # List scenarios without running them
//! trellis-e2e --list
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use trellis_e2e::{
    BuiltinSteps, EnvironmentConfig, EnvironmentName, LaunchOptions,
    ReportFormat as LibReportFormat, ReportWriter, RunConfig, ScenarioDecl, SuiteContext,
    TerminalReporter, TestRunner, Verbosity, WebDriverEngine, config, create_progress_callback,
    features,
};

/// Environment-aware scenario harness.
///
/// Resolves the target's configuration, starts in-process mocks for services
/// the target declares mocked and skips scenarios whose live services are down.
#[derive(Parser, Debug)]
#[command(name = "trellis-e2e")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Feature files or directories
    #[arg(default_value = "features")]
    pub features: Vec<PathBuf>,

    /// Execution target
    #[arg(long, value_enum, env = "TEST_ENV", default_value_t = EnvironmentName::Native)]
    pub environment: EnvironmentName,

    /// Mock every external service regardless of the target's declarations
    #[arg(long, env = "USE_MOCKS")]
    pub use_mocks: bool,

    /// Delay between streamed inference-mock chunks, for watching runs by eye
    #[arg(long, env = "MOCK_CHUNK_DELAY_MS", value_name = "MS")]
    pub chunk_delay_ms: Option<u64>,

    /// Run only scenarios whose id, name or feature contains this text
    #[arg(long)]
    pub filter: Option<String>,

    /// Run only scenarios carrying this tag (repeatable)
    #[arg(long = "tags", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Directory for failure snapshots and reports
    #[arg(long, default_value = ".e2e-artifacts")]
    pub artifacts_dir: PathBuf,

    /// Show the browser window instead of running headless
    #[arg(long)]
    pub headed: bool,

    /// List matching scenarios without running them
    #[arg(long)]
    pub list: bool,

    /// Show step-level output
    #[arg(short, long)]
    pub verbose: bool,

    /// Only show the final counts
    #[arg(short, long)]
    pub quiet: bool,

    /// Report written to the artifacts directory
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    pub report: ReportFormat,
}

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReportFormat {
    /// JSON report (machine-readable)
    #[default]
    Json,
    /// No file report
    None,
}

impl ReportFormat {
    fn to_lib_format(self) -> LibReportFormat {
        match self {
            ReportFormat::Json => LibReportFormat::Json,
            ReportFormat::None => LibReportFormat::None,
        }
    }
}

impl Cli {
    fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    fn launch_options(&self, environment: Arc<EnvironmentConfig>) -> LaunchOptions {
        let options = LaunchOptions::new(environment)
            .with_mocks(self.use_mocks)
            .with_artifacts_dir(&self.artifacts_dir);
        match self.chunk_delay_ms {
            Some(ms) => options.with_chunk_delay(Duration::from_millis(ms)),
            None => options,
        }
    }

    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::new();
        if let Some(filter) = &self.filter {
            config = config.with_filter(filter);
        }
        for tag in &self.tags {
            config = config.with_tag(tag);
        }
        config
    }
}

fn init_tracing(verbosity: Verbosity) {
    let default_filter = match verbosity {
        Verbosity::Quiet => "trellis_e2e=warn,trellis_mocks=warn",
        Verbosity::Normal => "trellis_e2e=info,trellis_mocks=info",
        Verbosity::Verbose => "trellis_e2e=debug,trellis_mocks=debug",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbosity = cli.verbosity();
    init_tracing(verbosity);

    if verbosity != Verbosity::Quiet {
        println!(
            "\n{} {}",
            "🌿 Trellis E2E".bold(),
            format!("v{}", trellis_e2e::VERSION).dimmed()
        );
        println!("{}", "━".repeat(40).dimmed());
    }

    let outcome = if cli.list {
        list_scenarios(&cli).map(|()| true)
    } else {
        run_scenarios(&cli, verbosity).await
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("\n{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn load_scenarios(cli: &Cli) -> anyhow::Result<Vec<ScenarioDecl>> {
    features::load(&cli.features).context("failed to load features")
}

fn list_scenarios(cli: &Cli) -> anyhow::Result<()> {
    let runner = TestRunner::new(load_scenarios(cli)?);
    let matching = runner.matching_scenarios(&cli.run_config());

    println!("{}\n", "Scenarios:".bold());

    let mut current_feature = "";
    for scenario in &matching {
        if scenario.feature != current_feature {
            current_feature = &scenario.feature;
            println!("  {}", current_feature.bold().underline());
        }
        let tags = scenario
            .tags
            .iter()
            .map(|t| format!("@{t}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("    {}  {}", scenario.id().cyan(), tags.dimmed());
    }

    if matching.is_empty() {
        println!("  {}", "No scenarios match".yellow());
    }

    println!(
        "\n  {}",
        format!(
            "Total: {} scenario{}",
            matching.len(),
            if matching.len() == 1 { "" } else { "s" }
        )
        .dimmed()
    );
    Ok(())
}

/// Returns whether the run passed.
async fn run_scenarios(cli: &Cli, verbosity: Verbosity) -> anyhow::Result<bool> {
    let environment = config::lookup(cli.environment);
    let scenarios = load_scenarios(cli)?;

    if verbosity != Verbosity::Quiet {
        println!(
            "{}",
            format!(
                "Environment: {} ({}){}",
                environment.name,
                environment.app_url,
                if cli.use_mocks { ", all services mocked" } else { "" }
            )
            .dimmed()
        );
    }

    let engine = WebDriverEngine::new(environment.webdriver_url.clone())
        .headless(!cli.headed)
        .timeout(environment.timeouts.page);
    let options = cli.launch_options(environment.clone());
    let mut suite = SuiteContext::new(options, Box::new(engine));

    let runner = TestRunner::new(scenarios)
        .with_executor(Box::new(BuiltinSteps::new()?))
        .on_progress(create_progress_callback(verbosity));

    let results = runner.run(&mut suite, &cli.run_config()).await?;

    let writer = ReportWriter::new(cli.artifacts_dir.clone(), environment.name.to_string());
    match writer.write(&results, cli.report.to_lib_format()) {
        Ok(paths) => {
            if verbosity != Verbosity::Quiet {
                for path in &paths {
                    println!("{}", format!("Report written: {}", path.display()).dimmed());
                }
            }
        }
        Err(e) => {
            eprintln!("{} Failed to write report: {}", "Warning:".yellow(), e);
        }
    }

    let reporter = TerminalReporter::with_verbosity(verbosity);
    if verbosity != Verbosity::Quiet {
        reporter.print_failures(&results);
        reporter.print_summary(&results);
    }

    Ok(results.all_passed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["trellis-e2e"]).unwrap();
        assert_eq!(cli.features, vec![PathBuf::from("features")]);
        assert_eq!(cli.artifacts_dir, PathBuf::from(".e2e-artifacts"));
        assert_eq!(cli.report, ReportFormat::Json);
        assert_eq!(cli.verbosity(), Verbosity::Normal);
    }

    #[test]
    fn test_cli_chunk_delay_overrides_target_pacing() {
        let environment = config::lookup(EnvironmentName::Ci);

        let cli = Cli::try_parse_from(["trellis-e2e", "--chunk-delay-ms", "120"]).unwrap();
        assert_eq!(cli.chunk_delay_ms, Some(120));
        let options = cli.launch_options(environment.clone());
        assert_eq!(options.chunk_delay(), Duration::from_millis(120));

        let cli = Cli::try_parse_from(["trellis-e2e"]).unwrap();
        assert_eq!(cli.launch_options(environment).chunk_delay(), Duration::ZERO);
    }

    #[test]
    fn test_cli_rejects_unknown_environment() {
        assert!(Cli::try_parse_from(["trellis-e2e", "--environment", "staging"]).is_err());
    }

    #[test]
    fn test_cli_run_config() {
        let cli = Cli::try_parse_from([
            "trellis-e2e",
            "--environment",
            "ci",
            "--filter",
            "graph",
            "--tags",
            "@smoke",
            "--tags",
            "isolated",
            "-q",
        ])
        .unwrap();
        assert_eq!(cli.environment, EnvironmentName::Ci);
        assert_eq!(cli.verbosity(), Verbosity::Quiet);
        let config = cli.run_config();
        assert_eq!(config.filter.as_deref(), Some("graph"));
        assert_eq!(config.tags, vec!["smoke", "isolated"]);
    }
}
