//! End-to-end runs of the fixture features against a fake application.
//!
//! The browser is a `FakeEngine`; the application-under-test is a small axum
//! app bound to an ephemeral port. Every live service locator points at a
//! closed port, so a scenario that runs against a "live" service would fail
//! its guard and be skipped.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trellis_e2e::testing::FakeEngine;
use trellis_e2e::{
    BuiltinSteps, EnvironmentConfig, EnvironmentName, HarnessError, LaunchOptions, ReportFormat,
    ReportWriter, RunConfig, RunResults, RunnerError, ScenarioStatus, StepStatus, SuiteContext,
    SuitePhase, TestReport, TestRunner, features,
};

const UNREACHABLE: &str = "http://127.0.0.1:9";

#[derive(Default)]
struct AppState {
    provider: Mutex<Value>,
    provider_puts: Mutex<Vec<Value>>,
    items: Mutex<BTreeMap<String, Value>>,
}

fn original_provider() -> Value {
    json!({"baseUrl": "http://localhost:1234", "model": "qwen2.5-7b-instruct"})
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn environment() -> Json<Value> {
    Json(json!({"containerized": false}))
}

async fn get_provider(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.provider.lock().unwrap().clone())
}

async fn put_provider(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> StatusCode {
    *state.provider.lock().unwrap() = body.clone();
    state.provider_puts.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}

async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut items = state.items.lock().unwrap();
    let id = format!("item-{}", items.len() + 1);
    body["id"] = json!(id);
    items.insert(id, body.clone());
    (StatusCode::CREATED, Json(body))
}

async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .items
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Serves the fake application; returns its base URL and shared state.
async fn spawn_app() -> (String, Arc<AppState>) {
    let state = Arc::new(AppState {
        provider: Mutex::new(original_provider()),
        ..Default::default()
    });
    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/environment", get(environment))
        .route(
            "/api/admin/inference-provider",
            get(get_provider).put(put_provider),
        )
        .route("/api/items", post(create_item))
        .route("/api/items/{id}", get(get_item))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn environment_config(name: EnvironmentName, app_url: &str) -> EnvironmentConfig {
    let mut config = EnvironmentConfig::declared(name);
    config.app_url = app_url.to_string();
    for descriptor in config.services.values_mut() {
        descriptor.locator = UNREACHABLE.to_string();
    }
    config.timeouts.api = Duration::from_secs(2);
    config
}

fn suite(
    config: EnvironmentConfig,
    artifacts: &std::path::Path,
    engine: &FakeEngine,
    use_mocks: bool,
) -> SuiteContext {
    let options = LaunchOptions::new(Arc::new(config))
        .with_mocks(use_mocks)
        .with_artifacts_dir(artifacts);
    SuiteContext::new(options, Box::new(engine.clone()))
}

fn runner() -> TestRunner {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/features");
    let scenarios = features::load(&[dir]).unwrap();
    TestRunner::new(scenarios).with_executor(Box::new(BuiltinSteps::new().unwrap()))
}

fn status_of(results: &RunResults, name: &str) -> ScenarioStatus {
    results
        .results
        .iter()
        .find(|r| r.name == name)
        .map(|r| r.status)
        .unwrap_or_else(|| panic!("no result for {name}"))
}

#[tokio::test]
async fn ci_runs_mocked_services_and_restores_provider() {
    let (app_url, state) = spawn_app().await;
    let artifacts = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new();
    let mut suite = suite(
        environment_config(EnvironmentName::Ci, &app_url),
        artifacts.path(),
        &engine,
        false,
    );

    let results = runner()
        .run(&mut suite, &RunConfig::new().with_filter("external services"))
        .await
        .unwrap();

    // lmstudio and ipfs are declared mocked in ci: never probed, never skipped.
    assert_eq!(
        status_of(&results, "Inference backend available"),
        ScenarioStatus::Passed
    );
    assert_eq!(
        status_of(&results, "Pinning backend available"),
        ScenarioStatus::Passed
    );
    // neo4j is live in ci and unreachable; the app is not containerized.
    assert_eq!(
        status_of(&results, "Graph backend available"),
        ScenarioStatus::Skipped
    );
    assert_eq!(
        status_of(&results, "Containerized stack"),
        ScenarioStatus::Skipped
    );
    assert_eq!(results.skipped_count, 2);
    assert!(results.all_passed());
    assert!(results.warnings.is_empty());

    let puts = state.provider_puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 2);
    let overridden = puts[0]["baseUrl"].as_str().unwrap();
    assert!(overridden.starts_with("http://127.0.0.1:"));
    assert_ne!(overridden, "http://localhost:1234");
    assert_eq!(puts[0]["model"], "qwen2.5-7b-instruct");
    assert_eq!(puts[1], original_provider());
    assert_eq!(*state.provider.lock().unwrap(), original_provider());

    assert_eq!(suite.phase(), SuitePhase::Idle);
    assert_eq!(engine.log().open_contexts(), 0);
}

#[tokio::test]
async fn native_unreachable_neo4j_is_skipped_not_failed() {
    let (app_url, state) = spawn_app().await;
    let artifacts = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new();
    let mut suite = suite(
        environment_config(EnvironmentName::Native, &app_url),
        artifacts.path(),
        &engine,
        false,
    );

    let results = runner()
        .run(&mut suite, &RunConfig::new().with_filter("graph backend"))
        .await
        .unwrap();

    assert_eq!(results.total_count(), 1);
    assert_eq!(results.skipped_count, 1);
    assert_eq!(results.executed_count(), 0);
    assert!(results.all_passed());

    let report = &results.results[0];
    assert!(report.skip_reason.as_deref().unwrap().contains("@requires-neo4j"));
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Skipped));
    assert!(report.screenshot.is_none());

    // Nothing mocked on native, so the application is never reconfigured.
    assert!(state.provider_puts.lock().unwrap().is_empty());
    let log = engine.log();
    assert_eq!(log.contexts_opened, 1);
    assert_eq!(log.contexts_closed, 1);
}

#[tokio::test]
async fn test_data_does_not_leak_between_scenarios() {
    let (app_url, _state) = spawn_app().await;
    let artifacts = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new();
    let mut suite = suite(
        environment_config(EnvironmentName::Native, &app_url),
        artifacts.path(),
        &engine,
        false,
    );

    let results = runner()
        .run(&mut suite, &RunConfig::new().with_filter("isolation"))
        .await
        .unwrap();

    assert_eq!(results.passed_count(), 2);
    assert!(results.all_passed());
    assert_eq!(engine.log().contexts_opened, 2);
    assert_eq!(engine.log().open_contexts(), 0);
}

#[tokio::test]
async fn failed_scenario_captures_snapshot_and_run_continues() {
    let (app_url, state) = spawn_app().await;
    let artifacts = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new();
    let mut suite = suite(
        environment_config(EnvironmentName::Native, &app_url),
        artifacts.path(),
        &engine,
        false,
    );

    let results = runner()
        .run(&mut suite, &RunConfig::new().with_tag("@api"))
        .await
        .unwrap();

    assert_eq!(results.total_count(), 3);
    assert_eq!(results.passed_count(), 2);
    assert_eq!(results.failed_count(), 1);
    assert!(!results.all_passed());
    assert_eq!(state.items.lock().unwrap().len(), 1);

    let failure = results.failures()[0];
    assert_eq!(failure.name, "Wrong status expectation");
    assert_eq!(
        failure.steps.iter().map(|s| s.status).collect::<Vec<_>>(),
        vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped]
    );
    assert!(failure.error.as_deref().unwrap().contains("status 500"));
    let snapshot = failure.screenshot.as_ref().unwrap();
    assert!(snapshot.starts_with(artifacts.path()));
    assert!(snapshot.exists());

    let written = ReportWriter::new(artifacts.path().to_path_buf(), "native")
        .write(&results, ReportFormat::Json)
        .unwrap();
    let report: TestReport =
        serde_json::from_str(&std::fs::read_to_string(&written[0]).unwrap()).unwrap();
    assert!(!report.passed);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.by_feature["Application API"].total, 3);
}

#[tokio::test]
async fn use_mocks_substitutes_every_service() {
    let (app_url, state) = spawn_app().await;
    let artifacts = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new();
    let mut suite = suite(
        environment_config(EnvironmentName::Native, &app_url),
        artifacts.path(),
        &engine,
        true,
    );

    let results = runner()
        .run(&mut suite, &RunConfig::new().with_filter("backend available"))
        .await
        .unwrap();

    assert_eq!(results.passed_count(), 3);
    assert_eq!(results.skipped_count, 0);
    assert_eq!(state.provider_puts.lock().unwrap().len(), 2);
    assert!(suite.mock_handles().graph.is_none());
}

#[tokio::test]
async fn startup_failure_runs_no_scenarios() {
    let artifacts = tempfile::tempdir().unwrap();
    let engine = FakeEngine::new();
    // ci mocks the inference backend, which needs the application's admin endpoint.
    let mut suite = suite(
        environment_config(EnvironmentName::Ci, UNREACHABLE),
        artifacts.path(),
        &engine,
        false,
    );

    let err = runner()
        .run(&mut suite, &RunConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunnerError::Startup(HarnessError::Reconfigure(_))
    ));
    assert_eq!(suite.phase(), SuitePhase::Idle);
    assert!(suite.inference_mock().is_none());
    let log = engine.log();
    assert_eq!(log.launches, 1);
    assert_eq!(log.closes, 1);
    assert_eq!(log.contexts_opened, 0);
}
