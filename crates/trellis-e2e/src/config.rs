//! Environment configuration registry.
//!
//! Each execution target (`native`, `docker`, `ci`) maps to one statically
//! declared [`EnvironmentConfig`]. Configurations are built once, on first
//! lookup, and handed out as `Arc`s so no component can mutate the active one.
//!
//! # Example
//!
//! ```
//! use trellis_e2e::config::{self, EnvironmentName};
//!
//! let ci = config::lookup(EnvironmentName::Ci);
//! assert!(ci.is_mocked("lmstudio"));
//!
//! // Unknown names fall back to `native` with a warning.
//! let fallback = config::resolve(Some("staging"));
//! assert_eq!(fallback.name, EnvironmentName::Native);
//! ```

use clap::ValueEnum;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Graph store service name.
pub const NEO4J: &str = "neo4j";
/// Inference backend service name.
pub const LMSTUDIO: &str = "lmstudio";
/// Content-pinning daemon service name.
pub const IPFS: &str = "ipfs";

/// Errors raised while selecting a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The name is not one of the declared targets.
    #[error("unknown environment '{0}' (expected native, docker or ci)")]
    UnknownEnvironment(String),
}

/// Execution target selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, ValueEnum)]
pub enum EnvironmentName {
    /// Application and services run directly on the host.
    #[default]
    Native,
    /// Application runs in a container stack.
    Docker,
    /// Continuous-integration stack with most services mocked.
    Ci,
}

impl EnvironmentName {
    /// All declared targets.
    pub fn all() -> &'static [EnvironmentName] {
        &[
            EnvironmentName::Native,
            EnvironmentName::Docker,
            EnvironmentName::Ci,
        ]
    }

    /// Lowercase name as accepted on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentName::Native => "native",
            EnvironmentName::Docker => "docker",
            EnvironmentName::Ci => "ci",
        }
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(EnvironmentName::Native),
            "docker" => Ok(EnvironmentName::Docker),
            "ci" => Ok(EnvironmentName::Ci),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

/// Per-target timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Page navigation.
    pub page: Duration,
    /// Application API calls and health probes.
    pub api: Duration,
    /// Element lookups in UI steps.
    pub element: Duration,
}

impl Timeouts {
    const fn secs(page: u64, api: u64, element: u64) -> Self {
        Self {
            page: Duration::from_secs(page),
            api: Duration::from_secs(api),
            element: Duration::from_secs(element),
        }
    }
}

/// Basic-auth credentials for a live service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach one external service, and whether it is substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Base URL of the live service.
    pub locator: String,
    pub credentials: Option<Credentials>,
    /// When set, the service is never probed and a mock adapter stands in.
    pub mock: bool,
}

impl ServiceDescriptor {
    /// A live service.
    pub fn live(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            credentials: None,
            mock: false,
        }
    }

    /// A service replaced by its mock adapter.
    pub fn mocked(locator: impl Into<String>) -> Self {
        Self {
            mock: true,
            ..Self::live(locator)
        }
    }

    /// Attaches basic-auth credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }
}

/// Where mock adapters listen and how the application reaches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSettings {
    /// Interface adapters bind to. Ports are always ephemeral.
    pub bind: IpAddr,
    /// Host name the application-under-test uses for adapter URLs.
    pub advertised_host: String,
    /// Pacing between streamed completion chunks.
    pub chunk_delay: Duration,
}

impl MockSettings {
    /// URL the application should use to reach an adapter on `port`.
    pub fn advertised_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.advertised_host, port)
    }
}

/// The resolved configuration for one execution target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub name: EnvironmentName,
    /// Base URL of the application-under-test.
    pub app_url: String,
    /// WebDriver endpoint used for browsing contexts.
    pub webdriver_url: String,
    /// Keyed by service name ([`NEO4J`], [`LMSTUDIO`], [`IPFS`]).
    pub services: BTreeMap<String, ServiceDescriptor>,
    pub timeouts: Timeouts,
    pub mocks: MockSettings,
}

impl EnvironmentConfig {
    /// Builds the declared configuration for `name`.
    pub fn declared(name: EnvironmentName) -> Self {
        let neo4j = ServiceDescriptor::live("http://localhost:7474")
            .with_credentials("neo4j", "password");
        let loopback = MockSettings {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertised_host: "127.0.0.1".to_string(),
            chunk_delay: Duration::ZERO,
        };

        match name {
            EnvironmentName::Native => Self {
                name,
                app_url: "http://localhost:3000".to_string(),
                webdriver_url: "http://localhost:4444".to_string(),
                services: BTreeMap::from([
                    (NEO4J.to_string(), neo4j),
                    (
                        LMSTUDIO.to_string(),
                        ServiceDescriptor::live("http://localhost:1234"),
                    ),
                    (
                        IPFS.to_string(),
                        ServiceDescriptor::live("http://localhost:5001"),
                    ),
                ]),
                timeouts: Timeouts::secs(30, 10, 5),
                mocks: loopback,
            },
            EnvironmentName::Docker => Self {
                name,
                app_url: "http://localhost:8080".to_string(),
                webdriver_url: "http://localhost:4444".to_string(),
                services: BTreeMap::from([
                    (NEO4J.to_string(), neo4j),
                    (
                        LMSTUDIO.to_string(),
                        ServiceDescriptor::mocked("http://host.docker.internal:1234"),
                    ),
                    (
                        IPFS.to_string(),
                        ServiceDescriptor::live("http://localhost:5001"),
                    ),
                ]),
                timeouts: Timeouts::secs(45, 15, 10),
                mocks: MockSettings {
                    bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    advertised_host: "host.docker.internal".to_string(),
                    chunk_delay: Duration::ZERO,
                },
            },
            EnvironmentName::Ci => Self {
                name,
                app_url: "http://localhost:3000".to_string(),
                webdriver_url: "http://localhost:4444".to_string(),
                services: BTreeMap::from([
                    (NEO4J.to_string(), neo4j),
                    (
                        LMSTUDIO.to_string(),
                        ServiceDescriptor::mocked("http://localhost:1234"),
                    ),
                    (
                        IPFS.to_string(),
                        ServiceDescriptor::mocked("http://localhost:5001"),
                    ),
                ]),
                timeouts: Timeouts::secs(60, 20, 10),
                mocks: loopback,
            },
        }
    }

    /// Looks up a service descriptor by name.
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    /// Whether the descriptor for `name` is declared mocked.
    ///
    /// Unknown services are treated as live.
    pub fn is_mocked(&self, name: &str) -> bool {
        self.service(name).is_some_and(|s| s.mock)
    }

    /// Joins an application path onto `app_url`.
    pub fn app_endpoint(&self, path: &str) -> String {
        join_url(&self.app_url, path)
    }
}

/// Joins `path` onto `base` with exactly one slash between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn registry() -> &'static BTreeMap<EnvironmentName, Arc<EnvironmentConfig>> {
    static REGISTRY: OnceLock<BTreeMap<EnvironmentName, Arc<EnvironmentConfig>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| {
        EnvironmentName::all()
            .iter()
            .map(|name| (*name, Arc::new(EnvironmentConfig::declared(*name))))
            .collect()
    })
}

/// Returns the shared configuration for a known target.
pub fn lookup(name: EnvironmentName) -> Arc<EnvironmentConfig> {
    match registry().get(&name) {
        Some(config) => Arc::clone(config),
        None => Arc::new(EnvironmentConfig::declared(name)),
    }
}

/// Resolves an optional, unvalidated name. Absent or unknown names fall back
/// to `native`.
pub fn resolve(name: Option<&str>) -> Arc<EnvironmentConfig> {
    let Some(raw) = name else {
        return lookup(EnvironmentName::default());
    };
    match raw.parse::<EnvironmentName>() {
        Ok(parsed) => lookup(parsed),
        Err(e) => {
            tracing::warn!("{}; falling back to native", e);
            lookup(EnvironmentName::Native)
        }
    }
}

/// Process-level launch parameters for one suite run.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub environment: Arc<EnvironmentConfig>,
    /// Force every service onto its mock adapter.
    pub use_mocks: bool,
    /// Where failure screenshots and reports are written.
    pub artifacts_dir: PathBuf,
    /// Overrides the target's streamed-chunk pacing for this run.
    pub chunk_delay: Option<Duration>,
}

impl LaunchOptions {
    /// Options for `environment` with live services and the default artifacts dir.
    pub fn new(environment: Arc<EnvironmentConfig>) -> Self {
        Self {
            environment,
            use_mocks: false,
            artifacts_dir: PathBuf::from(".e2e-artifacts"),
            chunk_delay: None,
        }
    }

    /// Paces streamed completions from the inference mock.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Pacing the inference mock should use: the override, else the target's.
    pub fn chunk_delay(&self) -> Duration {
        self.chunk_delay.unwrap_or(self.environment.mocks.chunk_delay)
    }

    /// Sets the force-mock flag.
    pub fn with_mocks(mut self, use_mocks: bool) -> Self {
        self.use_mocks = use_mocks;
        self
    }

    /// Sets the artifacts directory.
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = dir.into();
        self
    }

    /// `services[name].mock || use_mocks`.
    pub fn should_mock(&self, service: &str) -> bool {
        self.use_mocks || self.environment.is_mocked(service)
    }
}
