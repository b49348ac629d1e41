// src/report/guard.rs

//! Finalizer that guarantees every execution emits exactly one report.

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::report::model::{ExecutionReport, ExecutionStatus, FailureDetail};
use crate::types::Stage;

/// Owns the report of a running pipeline.
///
/// `finish` sends the report with its terminal status. If the guard is
/// dropped first (the pipeline panicked or its task was aborted), `Drop`
/// sends it as `Aborted`. The channel is unbounded so `Drop` never has to
/// wait.
pub struct ReportGuard {
    report: ExecutionReport,
    tx: mpsc::UnboundedSender<ExecutionReport>,
    stage: Option<Stage>,
    sent: bool,
}

impl ReportGuard {
    pub fn new(report: ExecutionReport, tx: mpsc::UnboundedSender<ExecutionReport>) -> Self {
        Self {
            report,
            tx,
            stage: None,
            sent: false,
        }
    }

    pub fn report(&self) -> &ExecutionReport {
        &self.report
    }

    pub fn report_mut(&mut self) -> &mut ExecutionReport {
        &mut self.report
    }

    /// Remember the stage in progress so an abort can name it.
    pub fn enter_stage(&mut self, stage: Stage) {
        self.stage = Some(stage);
    }

    /// Seal the report with its terminal status and hand it off.
    pub fn finish(mut self, status: ExecutionStatus, failure: Option<FailureDetail>) -> ExecutionReport {
        self.report.status = status;
        self.report.failure = failure;
        self.report.finished_at = Some(Utc::now());
        self.sent = true;

        let report = self.report.clone();
        if self.tx.send(report.clone()).is_err() {
            debug!(unit = %report.unit_id, "report channel closed; report not aggregated");
        }
        report
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if self.sent {
            return;
        }

        let stage = self.stage.unwrap_or(Stage::VerifyingDeps);
        warn!(
            unit = %self.report.unit_id,
            execution_id = %self.report.execution_id,
            %stage,
            "pipeline ended without a terminal state; emitting aborted report"
        );

        self.report.status = ExecutionStatus::Aborted;
        self.report.finished_at = Some(Utc::now());
        self.report.failure = Some(FailureDetail {
            stage,
            kind: "aborted".to_string(),
            message: "execution terminated unexpectedly".to_string(),
            categories: Vec::new(),
            output_tail: None,
        });
        let _ = self.tx.send(self.report.clone());
    }
}
