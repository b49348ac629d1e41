// src/report/model.rs

//! Per-execution report data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FailureCategory, Stage, UnitId};

/// How a single pipeline execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// Dependencies were not confirmed at start; the unit goes back to the queue.
    Requeued,
    /// The pipeline ended without reaching any terminal state (panic, abort).
    Aborted,
}

/// Wall time spent in each stage, in milliseconds. Quality time sums every
/// quality run, including re-runs after remediation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_deps_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_ms: Option<u64>,
}

impl StageTimings {
    pub fn record(&mut self, stage: Stage, ms: u64) {
        let slot = match stage {
            Stage::VerifyingDeps => &mut self.verify_deps_ms,
            Stage::Building => &mut self.build_ms,
            Stage::Testing => &mut self.test_ms,
            Stage::QualityChecking | Stage::Remediating => &mut self.quality_ms,
            Stage::Publishing => &mut self.publish_ms,
        };
        *slot = Some(slot.unwrap_or(0) + ms);
    }

    pub fn total_ms(&self) -> u64 {
        [
            self.verify_deps_ms,
            self.build_ms,
            self.test_ms,
            self.quality_ms,
            self.publish_ms,
        ]
        .iter()
        .flatten()
        .sum()
    }
}

/// Metrics parsed from the latest quality run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lint_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_errors: Option<u32>,
}

/// One pass through the remediation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAttempt {
    /// 1-based.
    pub attempt: u32,
    pub categories: Vec<FailureCategory>,
    /// Cache key of the prompt used.
    pub prompt_key: String,
    pub duration_ms: u64,
    pub applied: bool,
    /// Optional suggestions or questions returned by the oracle.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub advisory: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where and why an execution failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub stage: Stage,
    /// Failure class, e.g. `build`, `quality`, `publish`, `infrastructure`.
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<FailureCategory>,
    /// Last lines of the failing stage's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
}

/// Report for one execution attempt of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub unit_id: UnitId,
    pub execution_id: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Time between entering the orchestrator queue and launch.
    pub waited_ms: u64,
    pub stages: StageTimings,
    pub quality: QualityMetrics,
    #[serde(default)]
    pub remediation: Vec<RemediationAttempt>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
}

impl ExecutionReport {
    pub fn new(
        unit_id: impl Into<UnitId>,
        execution_id: impl Into<String>,
        attempt: u32,
        waited_ms: u64,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            execution_id: execution_id.into(),
            attempt,
            category: None,
            started_at: Utc::now(),
            finished_at: None,
            waited_ms,
            stages: StageTimings::default(),
            quality: QualityMetrics::default(),
            remediation: Vec::new(),
            status: ExecutionStatus::Aborted,
            failure: None,
        }
    }

    /// Wall time from start to finish, falling back to the stage sum while
    /// the execution is still open.
    pub fn duration_ms(&self) -> u64 {
        match self.finished_at {
            Some(end) => (end - self.started_at).num_milliseconds().max(0) as u64,
            None => self.stages.total_ms(),
        }
    }
}
