//! Tag guards: decide whether a scenario may run in the active environment.
//!
//! Each recognised tag maps to one entry of a static table. A service guard
//! passes without any network I/O when the service is mocked; otherwise it
//! probes the live service's status surface within the `api` timeout and
//! skips the scenario on any failure. Skips are never failures.
//!
//! | tag                 | probe                               |
//! |---------------------|-------------------------------------|
//! | `requires-neo4j`    | `GET {neo4j}/` with basic auth      |
//! | `requires-lmstudio` | `GET {lmstudio}/v1/models`          |
//! | `requires-ipfs`     | `POST {ipfs}/api/v0/id`             |
//! | `requires-docker`   | `GET {app}/api/environment`         |

use crate::config::{self, EnvironmentConfig, IPFS, LMSTUDIO, NEO4J};
use reqwest::Method;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// The closed set of guardable conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKind {
    Neo4j,
    LmStudio,
    Ipfs,
    Docker,
}

/// What a successful probe must show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipWhen {
    /// Any transport error, timeout or non-2xx status.
    NotSuccess,
    /// Anything but a JSON body with `"containerized": true`.
    NotContainerized,
}

/// One row of the guard table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardSpec {
    pub kind: GuardKind,
    /// Tag without the leading `@`.
    pub tag: &'static str,
    /// Service whose locator is probed; `None` probes the application itself.
    pub service: Option<&'static str>,
    pub method: ProbeMethod,
    pub path: &'static str,
    pub skip_when: SkipWhen,
}

/// HTTP method used by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Get,
    Post,
}

impl From<ProbeMethod> for Method {
    fn from(method: ProbeMethod) -> Self {
        match method {
            ProbeMethod::Get => Method::GET,
            ProbeMethod::Post => Method::POST,
        }
    }
}

/// Guard table, in no particular order; lookups go by tag.
pub static GUARDS: [GuardSpec; 4] = [
    GuardSpec {
        kind: GuardKind::Neo4j,
        tag: "requires-neo4j",
        service: Some(NEO4J),
        method: ProbeMethod::Get,
        path: "/",
        skip_when: SkipWhen::NotSuccess,
    },
    GuardSpec {
        kind: GuardKind::LmStudio,
        tag: "requires-lmstudio",
        service: Some(LMSTUDIO),
        method: ProbeMethod::Get,
        path: "/v1/models",
        skip_when: SkipWhen::NotSuccess,
    },
    GuardSpec {
        kind: GuardKind::Ipfs,
        tag: "requires-ipfs",
        service: Some(IPFS),
        method: ProbeMethod::Post,
        path: "/api/v0/id",
        skip_when: SkipWhen::NotSuccess,
    },
    GuardSpec {
        kind: GuardKind::Docker,
        tag: "requires-docker",
        service: None,
        method: ProbeMethod::Get,
        path: "/api/environment",
        skip_when: SkipWhen::NotContainerized,
    },
];

impl GuardKind {
    /// Maps a tag (with or without `@`) to its guard.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.strip_prefix('@').unwrap_or(tag);
        GUARDS.iter().find(|g| g.tag == tag).map(|g| g.kind)
    }

    /// The table row for this guard.
    pub fn spec(self) -> &'static GuardSpec {
        match self {
            GuardKind::Neo4j => &GUARDS[0],
            GuardKind::LmStudio => &GUARDS[1],
            GuardKind::Ipfs => &GUARDS[2],
            GuardKind::Docker => &GUARDS[3],
        }
    }
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.spec().tag)
    }
}

/// Outcome of evaluating a scenario's tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Run,
    Skip { guard: GuardKind, reason: String },
}

impl GuardVerdict {
    pub fn is_skip(&self) -> bool {
        matches!(self, GuardVerdict::Skip { .. })
    }
}

/// Everything a guard needs to decide.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub config: &'a EnvironmentConfig,
    pub use_mocks: bool,
    pub client: &'a reqwest::Client,
}

impl GuardContext<'_> {
    fn should_mock(&self, service: &str) -> bool {
        self.use_mocks || self.config.is_mocked(service)
    }
}

/// Guards triggered by `tags`, in declaration order, without duplicates.
pub fn guards_for(tags: &[String]) -> Vec<GuardKind> {
    let mut kinds = Vec::new();
    for kind in tags.iter().filter_map(|t| GuardKind::from_tag(t)) {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    kinds
}

/// Runs guards for `tags` in declaration order. The first skip wins and later
/// guards are not evaluated.
pub async fn evaluate_tags(tags: &[String], ctx: &GuardContext<'_>) -> GuardVerdict {
    for kind in guards_for(tags) {
        if let Err(reason) = evaluate(kind, ctx).await {
            tracing::info!("{} unsatisfied: {}", kind, reason);
            return GuardVerdict::Skip {
                guard: kind,
                reason,
            };
        }
    }
    GuardVerdict::Run
}

/// Evaluates one guard. `Err` carries the skip reason.
pub async fn evaluate(kind: GuardKind, ctx: &GuardContext<'_>) -> Result<(), String> {
    let spec = kind.spec();

    let (base, credentials) = match spec.service {
        Some(service) => {
            if ctx.should_mock(service) {
                tracing::debug!("{} satisfied by {} mock", kind, service);
                return Ok(());
            }
            let descriptor = ctx
                .config
                .service(service)
                .ok_or_else(|| format!("service '{service}' is not configured"))?;
            (descriptor.locator.as_str(), descriptor.credentials.as_ref())
        }
        None => (ctx.config.app_url.as_str(), None),
    };

    let url = config::join_url(base, spec.path);
    let timeout = ctx.config.timeouts.api;
    tracing::debug!("Probing {} for {}", url, kind);

    let mut request = ctx
        .client
        .request(spec.method.into(), &url)
        .timeout(timeout);
    if let Some(credentials) = credentials {
        request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }

    let response = match tokio::time::timeout(timeout, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(describe_transport_error(&url, &e, timeout)),
        Err(_) => return Err(format!("{url} did not answer within {timeout:?}")),
    };

    let status = response.status();
    if !status.is_success() {
        return Err(format!("{url} returned {status}"));
    }

    match spec.skip_when {
        SkipWhen::NotSuccess => Ok(()),
        SkipWhen::NotContainerized => {
            let body: Value = response
                .json()
                .await
                .map_err(|e| format!("{url} returned an unreadable body: {e}"))?;
            if body.get("containerized").and_then(Value::as_bool) == Some(true) {
                Ok(())
            } else {
                Err("application is not running in a container".to_string())
            }
        }
    }
}

fn describe_transport_error(url: &str, error: &reqwest::Error, timeout: Duration) -> String {
    if error.is_timeout() {
        format!("{url} did not answer within {timeout:?}")
    } else if error.is_connect() {
        format!("{url} is unreachable")
    } else {
        format!("{url} probe failed: {error}")
    }
}
