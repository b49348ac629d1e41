use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical unit identifier used throughout the crate.
pub type UnitId = String;

/// Externally visible status of a unit.
///
/// `Pending` covers units waiting on dependencies, units waiting out a retry
/// backoff, and units blocked forever behind a failed dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Queued => "queued",
            UnitStatus::Running => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Whether the orchestrator launches new work.
///
/// `Terminated` and `EmergencyStopped` are terminal and never written to a
/// checkpoint as a resumable state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    #[default]
    Running,
    Paused,
    Draining,
    Terminated,
    EmergencyStopped,
}

impl ControlState {
    pub fn accepts_intake(self) -> bool {
        matches!(self, ControlState::Running | ControlState::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ControlState::Terminated | ControlState::EmergencyStopped)
    }
}

/// Growth curve for retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    #[default]
    Exponential,
    Fibonacci,
}

impl FromStr for BackoffPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exponential" => Ok(BackoffPolicy::Exponential),
            "fibonacci" => Ok(BackoffPolicy::Fibonacci),
            other => Err(format!(
                "invalid backoff: {other} (expected \"exponential\" or \"fibonacci\")"
            )),
        }
    }
}

/// Where ready units come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Units come from the `[unit.<id>]` manifest and statuses are kept in memory.
    #[default]
    Manifest,
    /// Units and statuses live in a JSON document shared with other tools.
    File,
}

/// Pipeline stage names, used in reports, logs and failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    VerifyingDeps,
    Building,
    Testing,
    QualityChecking,
    Remediating,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::VerifyingDeps => "verifying-deps",
            Stage::Building => "building",
            Stage::Testing => "testing",
            Stage::QualityChecking => "quality-checking",
            Stage::Remediating => "remediating",
            Stage::Publishing => "publishing",
        };
        f.write_str(s)
    }
}

/// Category of a quality-gate failure. Ordering is stable so that sorted sets
/// of categories make deterministic cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Lint,
    TypeCheck,
    Coverage,
    Format,
    Other,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Lint => "lint",
            FailureCategory::TypeCheck => "type_check",
            FailureCategory::Coverage => "coverage",
            FailureCategory::Format => "format",
            FailureCategory::Other => "other",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "lint" => Ok(FailureCategory::Lint),
            "type_check" | "typecheck" | "types" => Ok(FailureCategory::TypeCheck),
            "coverage" => Ok(FailureCategory::Coverage),
            "format" | "fmt" => Ok(FailureCategory::Format),
            "other" => Ok(FailureCategory::Other),
            other => Err(format!("unknown failure category: {other}")),
        }
    }
}

/// Stable identifier of one pipeline attempt for one unit.
///
/// Live handles for an execution are looked up by this id in the pipeline
/// backend, so a completion for a superseded execution can be recognized and
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn generate() -> Self {
        ExecutionId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        ExecutionId(s.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        ExecutionId(s)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
