//! Step execution.
//!
//! Business step definitions implement [`StepExecutor`] and talk to the
//! application only through [`World`]. [`BuiltinSteps`] covers the generic
//! API, navigation, scratch-data and mock-inspection steps every suite needs.
//!
//! Quoted arguments may reference remembered values as `{key}`:
//!
//! ```gherkin
//! When I POST "/api/nodes"
//! And I remember the response JSON at "/id" as "node"
//! Then I GET "/api/nodes/{node}"
//! ```

use crate::features::StepDecl;
use crate::world::{World, WorldError};
use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::Method;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors that fail a step (and so the scenario).
#[derive(Debug, Error)]
pub enum StepError {
    /// No executor recognises the step text.
    #[error("undefined step: {0}")]
    Undefined(String),

    /// An expectation did not hold.
    #[error("expected {expected}, got {actual}")]
    Assertion { expected: String, actual: String },

    /// A world operation failed.
    #[error(transparent)]
    World(#[from] WorldError),

    /// A step argument could not be interpreted.
    #[error("invalid step argument: {0}")]
    Argument(String),

    /// A built-in step pattern failed to compile.
    #[error("invalid step pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// An assertion needed a response but no request has been made.
    #[error("no API response recorded yet")]
    NoResponse,
}

impl StepError {
    fn assertion(expected: impl ToString, actual: impl ToString) -> Self {
        StepError::Assertion {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// A set of step definitions.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Whether this executor defines `step`.
    fn handles(&self, step: &StepDecl) -> bool;

    /// Runs a step this executor [`handles`](StepExecutor::handles).
    async fn execute(&self, step: &StepDecl, world: &mut World) -> Result<(), StepError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Request,
    Status,
    BodyContains,
    JsonEquals,
    RememberJson,
    SetValue,
    NoTestData,
    Navigate,
    UrlContains,
    GraphNode,
    GraphCount,
    PinCount,
    InferenceRunning,
}

const PATTERNS: &[(&str, Builtin)] = &[
    (r#"^I (GET|POST|PUT|DELETE) "([^"]+)"$"#, Builtin::Request),
    (r"^the response status should be (\d{3})$", Builtin::Status),
    (
        r#"^the response body should contain "([^"]*)"$"#,
        Builtin::BodyContains,
    ),
    (
        r#"^the response JSON at "([^"]+)" should be (.+)$"#,
        Builtin::JsonEquals,
    ),
    (
        r#"^I remember the response JSON at "([^"]+)" as "([^"]+)"$"#,
        Builtin::RememberJson,
    ),
    (r#"^I set "([^"]+)" to "([^"]*)"$"#, Builtin::SetValue),
    (r"^no test data should be remembered$", Builtin::NoTestData),
    (r#"^I (?:navigate|go) to "([^"]+)"$"#, Builtin::Navigate),
    (
        r#"^the page URL should contain "([^"]+)"$"#,
        Builtin::UrlContains,
    ),
    (
        r#"^I add a node "([^"]+)"(?: labelled "([^"]+)")? to the graph mock$"#,
        Builtin::GraphNode,
    ),
    (r"^the graph mock should hold (\d+) nodes?$", Builtin::GraphCount),
    (r"^the pin mock should hold (\d+) pins?$", Builtin::PinCount),
    (
        r"^the inference mock should be running$",
        Builtin::InferenceRunning,
    ),
];

/// Generic steps shipped with the harness.
#[derive(Debug)]
pub struct BuiltinSteps {
    patterns: Vec<(Regex, Builtin)>,
}

impl BuiltinSteps {
    pub fn new() -> Result<Self, StepError> {
        let patterns = PATTERNS
            .iter()
            .map(|(pattern, builtin)| Ok((Regex::new(pattern)?, *builtin)))
            .collect::<Result<Vec<_>, StepError>>()?;
        Ok(Self { patterns })
    }

    fn matching<'t>(&self, text: &'t str) -> Option<(Builtin, Captures<'t>)> {
        self.patterns
            .iter()
            .find_map(|(re, builtin)| re.captures(text).map(|caps| (*builtin, caps)))
    }
}

fn group(caps: &Captures<'_>, index: usize) -> String {
    caps.get(index)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Replaces `{key}` with remembered values. Unknown keys are left as-is.
pub fn interpolate(text: &str, world: &World) -> String {
    let mut out = text.to_string();
    for (key, value) in world.test_data() {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{key}}}"), &rendered);
    }
    out
}

/// Parses a literal from step text as JSON, falling back to a plain string.
fn literal(text: &str) -> Value {
    serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.trim().to_string()))
}

fn parse_count(raw: &str) -> Result<usize, StepError> {
    raw.parse()
        .map_err(|_| StepError::Argument(format!("'{raw}' is not a count")))
}

#[async_trait]
impl StepExecutor for BuiltinSteps {
    fn handles(&self, step: &StepDecl) -> bool {
        self.matching(&step.text).is_some()
    }

    async fn execute(&self, step: &StepDecl, world: &mut World) -> Result<(), StepError> {
        let (builtin, first, second) = {
            let (builtin, caps) = self
                .matching(&step.text)
                .ok_or_else(|| StepError::Undefined(step.text.clone()))?;
            (
                builtin,
                interpolate(&group(&caps, 1), world),
                interpolate(&group(&caps, 2), world),
            )
        };

        match builtin {
            Builtin::Request => {
                let method = Method::from_bytes(first.as_bytes())
                    .map_err(|e| StepError::Argument(e.to_string()))?;
                let body = match &step.docstring {
                    Some(doc) => Some(
                        serde_json::from_str(&interpolate(doc, world))
                            .map_err(|e| StepError::Argument(format!("request body: {e}")))?,
                    ),
                    None => None,
                };
                world.request(method, &second, body).await?;
                Ok(())
            }
            Builtin::Status => {
                let expected: u16 = first
                    .parse()
                    .map_err(|_| StepError::Argument(format!("'{first}' is not a status")))?;
                let response = world.last_response().ok_or(StepError::NoResponse)?;
                if response.status == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(
                        format!("status {expected}"),
                        format!("status {} ({})", response.status, response.text),
                    ))
                }
            }
            Builtin::BodyContains => {
                let response = world.last_response().ok_or(StepError::NoResponse)?;
                if response.text.contains(&first) {
                    Ok(())
                } else {
                    Err(StepError::assertion(
                        format!("body containing '{first}'"),
                        &response.text,
                    ))
                }
            }
            Builtin::JsonEquals => {
                let response = world.last_response().ok_or(StepError::NoResponse)?;
                let expected = literal(&second);
                let actual = response.body.pointer(&first).cloned().unwrap_or(Value::Null);
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(
                        format!("{first} = {expected}"),
                        format!("{first} = {actual}"),
                    ))
                }
            }
            Builtin::RememberJson => {
                let response = world.last_response().ok_or(StepError::NoResponse)?;
                let value = response
                    .body
                    .pointer(&first)
                    .cloned()
                    .ok_or_else(|| StepError::assertion(format!("a value at {first}"), "nothing"))?;
                world.remember(second, value);
                Ok(())
            }
            Builtin::SetValue => {
                world.remember(first, json!(second));
                Ok(())
            }
            Builtin::NoTestData => {
                let keys: Vec<&String> = world.test_data().keys().collect();
                if keys.is_empty() {
                    Ok(())
                } else {
                    Err(StepError::assertion("no remembered keys", format!("{keys:?}")))
                }
            }
            Builtin::Navigate => {
                world.navigate(&first).await?;
                Ok(())
            }
            Builtin::UrlContains => {
                let url = world.current_url().await?;
                if url.contains(&first) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!("URL containing '{first}'"), url))
                }
            }
            Builtin::GraphNode => {
                let graph = world
                    .mocks()
                    .graph
                    .clone()
                    .ok_or_else(|| StepError::Argument("graph mock is not running".to_string()))?;
                let data = if second.is_empty() {
                    json!({})
                } else {
                    json!({ "category": second })
                };
                graph
                    .upsert(&first, data)
                    .map_err(|e| StepError::Argument(e.to_string()))?;
                Ok(())
            }
            Builtin::GraphCount => {
                let expected = parse_count(&first)?;
                let graph = world
                    .mocks()
                    .graph
                    .as_ref()
                    .ok_or_else(|| StepError::Argument("graph mock is not running".to_string()))?;
                let actual = graph.stats().nodes;
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(
                        format!("{expected} nodes"),
                        format!("{actual} nodes"),
                    ))
                }
            }
            Builtin::PinCount => {
                let expected = parse_count(&first)?;
                let pins = world
                    .mocks()
                    .pins
                    .as_ref()
                    .ok_or_else(|| StepError::Argument("pin mock is not running".to_string()))?;
                let actual = pins.status().pin_count;
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(
                        format!("{expected} pins"),
                        format!("{actual} pins"),
                    ))
                }
            }
            Builtin::InferenceRunning => match &world.mocks().inference_url {
                Some(_) => Ok(()),
                None => Err(StepError::assertion("inference mock running", "not started")),
            },
        }
    }
}

/// Runs a step on the first executor that handles it.
pub async fn dispatch(
    executors: &[Box<dyn StepExecutor>],
    step: &StepDecl,
    world: &mut World,
) -> Result<(), StepError> {
    match executors.iter().find(|e| e.handles(step)) {
        Some(executor) => executor.execute(step, world).await,
        None => Err(StepError::Undefined(format!("{} {}", step.keyword, step.text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserEngine;
    use crate::config::{EnvironmentName, lookup};
    use crate::testing::FakeEngine;
    use crate::world::MockHandles;
    use trellis_mocks::{GraphStore, PinRequest, PinStore};

    async fn world_with(mocks: MockHandles) -> (World, FakeEngine) {
        let mut engine = FakeEngine::new();
        engine.launch().await.unwrap();
        let world = World::construct(lookup(EnvironmentName::Ci), &engine, false, mocks)
            .await
            .unwrap();
        (world, engine)
    }

    #[test]
    fn test_builtin_patterns_compile() {
        let steps = BuiltinSteps::new().unwrap();
        assert_eq!(steps.patterns.len(), PATTERNS.len());
    }

    #[test]
    fn test_handles() {
        let steps = BuiltinSteps::new().unwrap();
        assert!(steps.handles(&StepDecl::new("When", r#"I GET "/api/health""#)));
        assert!(steps.handles(&StepDecl::new("Then", "the response status should be 200")));
        assert!(steps.handles(&StepDecl::new("Given", "I add a node \"ada\" to the graph mock")));
        assert!(!steps.handles(&StepDecl::new("Given", "I fly to the moon")));
        assert!(!steps.handles(&StepDecl::new(
            "Given",
            "the graph mock contains a node \"ada\""
        )));
    }

    #[tokio::test]
    async fn test_set_and_interpolate() {
        let steps = BuiltinSteps::new().unwrap();
        let (mut world, _engine) = world_with(MockHandles::default()).await;

        steps
            .execute(&StepDecl::new("Given", r#"I set "id" to "ada""#), &mut world)
            .await
            .unwrap();
        assert_eq!(interpolate("/api/nodes/{id}", &world), "/api/nodes/ada");
        assert_eq!(interpolate("/api/{missing}", &world), "/api/{missing}");

        let err = steps
            .execute(
                &StepDecl::new("Then", "no test data should be remembered"),
                &mut world,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Assertion { .. }));

        world.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_without_request_fails() {
        let steps = BuiltinSteps::new().unwrap();
        let (mut world, _engine) = world_with(MockHandles::default()).await;
        let err = steps
            .execute(
                &StepDecl::new("Then", "the response status should be 200"),
                &mut world,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::NoResponse));
        world.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_steps() {
        let steps = BuiltinSteps::new().unwrap();
        let graph = GraphStore::new();
        let pins = PinStore::default();
        pins.pin(PinRequest::path("a.txt")).unwrap();
        let (mut world, _engine) = world_with(MockHandles {
            graph: Some(graph.clone()),
            pins: Some(pins),
            inference_url: Some("http://127.0.0.1:1".to_string()),
        })
        .await;

        for text in [
            r#"I add a node "ada" labelled "Person" to the graph mock"#,
            "the graph mock should hold 1 node",
            "the pin mock should hold 1 pin",
            "the inference mock should be running",
        ] {
            steps
                .execute(&StepDecl::new("Given", text), &mut world)
                .await
                .unwrap();
        }
        assert_eq!(graph.get("ada").unwrap().category(), "Person");

        world.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_steps_without_mocks() {
        let steps = BuiltinSteps::new().unwrap();
        let (mut world, _engine) = world_with(MockHandles::default()).await;
        let err = steps
            .execute(
                &StepDecl::new("Then", "the inference mock should be running"),
                &mut world,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Assertion { .. }));
        world.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_navigate_step() {
        let steps = BuiltinSteps::new().unwrap();
        let (mut world, engine) = world_with(MockHandles::default()).await;
        steps
            .execute(&StepDecl::new("When", r#"I navigate to "/graph""#), &mut world)
            .await
            .unwrap();
        steps
            .execute(
                &StepDecl::new("Then", r#"the page URL should contain "/graph""#),
                &mut world,
            )
            .await
            .unwrap();
        assert_eq!(engine.log().navigations, vec!["http://localhost:3000/graph"]);
        world.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_undefined() {
        let executors: Vec<Box<dyn StepExecutor>> = vec![Box::new(BuiltinSteps::new().unwrap())];
        let (mut world, _engine) = world_with(MockHandles::default()).await;
        let err = dispatch(&executors, &StepDecl::new("Given", "a unicorn"), &mut world)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "undefined step: Given a unicorn");
        world.destroy().await.unwrap();
    }

    #[test]
    fn test_literal() {
        assert_eq!(literal("\"ada\""), json!("ada"));
        assert_eq!(literal("3"), json!(3));
        assert_eq!(literal("true"), json!(true));
        assert_eq!(literal("plain words"), json!("plain words"));
    }
}
