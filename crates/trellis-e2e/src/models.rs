//! Data models for scenario results and reports.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// JSON report in the artifacts directory
    #[default]
    Json,
    /// Terminal output only
    None,
}

/// Final state of one scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    /// A tag guard found a required live service unavailable.
    Skipped,
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    /// Not run because an earlier step failed.
    Skipped,
}

/// A step as executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Keyword and text, e.g. `When I GET "/api/health"`
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
}

/// Result of one scenario execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// `feature-slug/scenario-slug`
    pub scenario_id: String,
    pub name: String,
    pub feature: String,
    pub tags: Vec<String>,
    pub status: ScenarioStatus,
    pub steps: Vec<StepResult>,
    /// Why the scenario was skipped
    pub skip_reason: Option<String>,
    /// First error that failed the scenario
    pub error: Option<String>,
    /// Page snapshot captured on failure
    pub screenshot: Option<PathBuf>,
    /// Teardown problems; never change `status`
    pub warnings: Vec<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    pub fn failed(&self) -> bool {
        self.status == ScenarioStatus::Failed
    }

    pub fn skipped(&self) -> bool {
        self.status == ScenarioStatus::Skipped
    }
}

/// Serde helper for Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
