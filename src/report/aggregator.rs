// src/report/aggregator.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::report::model::{ExecutionReport, ExecutionStatus};
use crate::report::writer::ReportWriter;
use crate::types::UnitId;

/// How many entries the "slowest" and "most remediated" lists keep.
const TOP_N: usize = 5;

/// Final scheduling outcome, supplied by the orchestrator when the suite ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteOutcome {
    pub completed: Vec<UnitId>,
    pub failed: Vec<UnitId>,
    /// Units that never ran because a dependency failed or never completed.
    pub blocked: Vec<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTiming {
    pub unit_id: UnitId,
    pub execution_id: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRemediation {
    pub unit_id: UnitId,
    pub attempts: u32,
}

/// Suite-level summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub generated_at: DateTime<Utc>,
    pub executions: usize,
    pub completed: Vec<UnitId>,
    pub failed: Vec<UnitId>,
    pub blocked: Vec<UnitId>,
    pub cancelled_executions: usize,
    pub aborted_executions: usize,
    pub slowest: Vec<UnitTiming>,
    pub most_remediated: Vec<UnitRemediation>,
    pub total_remediation_attempts: u32,
    /// Sum over executions of the time spent queued before launch.
    pub total_wait_ms: u64,
    pub suite_success: bool,
}

/// Append-only collector of execution reports.
///
/// Never touches orchestrator state; it only sees reports and, at the end,
/// the [`SuiteOutcome`].
#[derive(Debug, Default)]
pub struct ReportAggregator {
    reports: Vec<ExecutionReport>,
    writer: Option<ReportWriter>,
}

impl ReportAggregator {
    pub fn new(writer: Option<ReportWriter>) -> Self {
        Self {
            reports: Vec::new(),
            writer,
        }
    }

    pub fn reports(&self) -> &[ExecutionReport] {
        &self.reports
    }

    /// Reports for one unit, in arrival order.
    pub fn reports_for(&self, unit: &str) -> Vec<&ExecutionReport> {
        self.reports.iter().filter(|r| r.unit_id == unit).collect()
    }

    pub fn record(&mut self, report: ExecutionReport) {
        debug!(
            unit = %report.unit_id,
            execution_id = %report.execution_id,
            status = ?report.status,
            "aggregating execution report"
        );

        if let Some(writer) = &self.writer {
            if let Err(err) = writer.write_unit(&report) {
                warn!(unit = %report.unit_id, error = %format!("{err:#}"), "failed to write unit report");
            }
        }

        self.reports.push(report);
    }

    pub fn summary(&self, outcome: &SuiteOutcome) -> SuiteSummary {
        let mut slowest: Vec<UnitTiming> = self
            .reports
            .iter()
            .filter(|r| r.status != ExecutionStatus::Requeued)
            .map(|r| UnitTiming {
                unit_id: r.unit_id.clone(),
                execution_id: r.execution_id.clone(),
                duration_ms: r.duration_ms(),
            })
            .collect();
        slowest.sort_by(|a, b| {
            b.duration_ms
                .cmp(&a.duration_ms)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        slowest.truncate(TOP_N);

        let mut per_unit: BTreeMap<&str, u32> = BTreeMap::new();
        for r in &self.reports {
            *per_unit.entry(r.unit_id.as_str()).or_default() += r.remediation.len() as u32;
        }
        let total_remediation_attempts = per_unit.values().sum();
        let mut most_remediated: Vec<UnitRemediation> = per_unit
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(unit, attempts)| UnitRemediation {
                unit_id: unit.to_string(),
                attempts,
            })
            .collect();
        most_remediated.sort_by(|a, b| {
            b.attempts
                .cmp(&a.attempts)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        most_remediated.truncate(TOP_N);

        let count = |status: ExecutionStatus| {
            self.reports.iter().filter(|r| r.status == status).count()
        };

        SuiteSummary {
            generated_at: Utc::now(),
            executions: self.reports.len(),
            completed: sorted(&outcome.completed),
            failed: sorted(&outcome.failed),
            blocked: sorted(&outcome.blocked),
            cancelled_executions: count(ExecutionStatus::Cancelled),
            aborted_executions: count(ExecutionStatus::Aborted),
            slowest,
            most_remediated,
            total_remediation_attempts,
            total_wait_ms: self.reports.iter().map(|r| r.waited_ms).sum(),
            suite_success: outcome.failed.is_empty() && outcome.blocked.is_empty(),
        }
    }

    /// Build the summary and write it, if a writer is configured.
    pub fn finish(&self, outcome: &SuiteOutcome) -> SuiteSummary {
        let summary = self.summary(outcome);

        if let Some(writer) = &self.writer {
            match writer.write_summary(&summary) {
                Ok(path) => info!(path = %path.display(), "suite summary written"),
                Err(err) => warn!(error = %format!("{err:#}"), "failed to write suite summary"),
            }
        }

        info!(
            executions = summary.executions,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            blocked = summary.blocked.len(),
            success = summary.suite_success,
            "suite finished"
        );
        summary
    }
}

/// Consume reports until every sender is dropped, then hand the aggregator
/// back for the final summary.
pub fn spawn_aggregator(
    mut aggregator: ReportAggregator,
    mut rx: mpsc::UnboundedReceiver<ExecutionReport>,
) -> JoinHandle<ReportAggregator> {
    tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            aggregator.record(report);
        }
        debug!("report channel closed; aggregator finished");
        aggregator
    })
}

fn sorted(ids: &[UnitId]) -> Vec<UnitId> {
    let mut v = ids.to_vec();
    v.sort();
    v
}
