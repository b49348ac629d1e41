// src/exec/pipeline.rs

//! Per-unit execution pipeline.
//!
//! ```text
//! verifying-deps -> building -> testing -> quality-checking
//!     -> (remediating <-> quality-checking) -> publishing -> done
//! ```
//!
//! Any stage can end the pipeline with a [`PipelineFailure`]. The pipeline
//! never touches orchestrator state: it returns a [`PipelineOutcome`] and
//! hands its report to the aggregator through a [`ReportGuard`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::dag::UnitSpec;
use crate::exec::cancel::CancelFlag;
use crate::exec::quality::{MetricsParser, QualityClassifier};
use crate::exec::remediation::{PromptCache, RemediationOracle, RemediationRequest};
use crate::exec::stages::{StageResult, StageRunner};
use crate::report::{
    ExecutionReport, ExecutionStatus, FailureDetail, RemediationAttempt, ReportGuard,
};
use crate::types::{ExecutionId, FailureCategory, Stage, UnitId};
use crate::workqueue::{bounded, WorkQueueClient};

/// Output lines kept in failure records and oracle requests.
const OUTPUT_TAIL_LINES: usize = 40;

/// Request to run one pipeline, as emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub unit: UnitSpec,
    pub execution_id: ExecutionId,
    /// 1-based attempt number for this unit.
    pub attempt: u32,
    /// Time the unit spent in the orchestrator queue before launch.
    pub waited: Duration,
}

/// Why a pipeline failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineFailure {
    #[error("dependencies not completed in registry: {}", missing.join(", "))]
    DependencyNotSatisfied { missing: Vec<UnitId> },

    #[error("build failed: {message}")]
    Build { message: String },

    #[error("tests failed: {message}")]
    Test { message: String },

    #[error("quality gate failed ({}) after {attempts} remediation attempt(s)", join_categories(categories))]
    Quality {
        categories: Vec<FailureCategory>,
        attempts: u32,
    },

    #[error("publish failed: {message}")]
    Publish { message: String },

    #[error("infrastructure error during {stage}: {message}")]
    Infrastructure { stage: Stage, message: String },
}

impl PipelineFailure {
    /// Only infrastructure failures are worth retrying as-is; the rest point
    /// at the unit's code or are already retried inside the pipeline.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineFailure::Infrastructure { .. })
    }

    pub fn stage(&self) -> Stage {
        match self {
            PipelineFailure::DependencyNotSatisfied { .. } => Stage::VerifyingDeps,
            PipelineFailure::Build { .. } => Stage::Building,
            PipelineFailure::Test { .. } => Stage::Testing,
            PipelineFailure::Quality { .. } => Stage::QualityChecking,
            PipelineFailure::Publish { .. } => Stage::Publishing,
            PipelineFailure::Infrastructure { stage, .. } => *stage,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineFailure::DependencyNotSatisfied { .. } => "dependency_not_satisfied",
            PipelineFailure::Build { .. } => "build",
            PipelineFailure::Test { .. } => "test",
            PipelineFailure::Quality { .. } => "quality",
            PipelineFailure::Publish { .. } => "publish",
            PipelineFailure::Infrastructure { .. } => "infrastructure",
        }
    }
}

fn join_categories(categories: &[FailureCategory]) -> String {
    categories
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// How a pipeline ended, as reported back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Succeeded,
    Failed(PipelineFailure),
    Cancelled,
}

/// Knobs for the pipeline, usually taken from [`ConfigFile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_remediation_attempts: u32,
    pub stage_timeout: Option<Duration>,
    pub registry_timeout: Duration,
    /// Base directory for relative unit paths in oracle requests.
    pub base_dir: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_remediation_attempts: 3,
            stage_timeout: None,
            registry_timeout: Duration::from_secs(10),
            base_dir: PathBuf::from("."),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(cfg: &ConfigFile, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_remediation_attempts: cfg.remediation.max_attempts,
            stage_timeout: cfg.timings.stage_timeout,
            registry_timeout: cfg.timings.registry_timeout,
            base_dir: base_dir.into(),
        }
    }
}

/// Collaborators shared by every pipeline.
pub struct PipelineContext {
    pub stages: Arc<dyn StageRunner>,
    pub oracle: Option<Arc<dyn RemediationOracle>>,
    pub registry: Arc<dyn WorkQueueClient>,
    pub prompts: PromptCache,
    pub classifier: QualityClassifier,
    pub metrics: MetricsParser,
    pub settings: PipelineSettings,
    pub reports: mpsc::UnboundedSender<ExecutionReport>,
}

impl PipelineContext {
    pub fn new(
        stages: Arc<dyn StageRunner>,
        registry: Arc<dyn WorkQueueClient>,
        reports: mpsc::UnboundedSender<ExecutionReport>,
    ) -> Self {
        Self {
            stages,
            oracle: None,
            registry,
            prompts: PromptCache::default(),
            classifier: QualityClassifier::default(),
            metrics: MetricsParser::default(),
            settings: PipelineSettings::default(),
            reports,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RemediationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_prompts(mut self, prompts: PromptCache) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_classifier(mut self, classifier: QualityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Why `drive` stopped early.
enum Halt {
    Cancelled(Stage),
    Failed(PipelineFailure, FailureDetail),
}

/// Run one execution to completion and emit its report.
pub async fn run_pipeline(
    ctx: Arc<PipelineContext>,
    request: LaunchRequest,
    cancel: CancelFlag,
) -> PipelineOutcome {
    let mut report = ExecutionReport::new(
        request.unit.id.clone(),
        request.execution_id.to_string(),
        request.attempt,
        request.waited.as_millis() as u64,
    );
    report.category = request.unit.category.clone();

    let mut guard = ReportGuard::new(report, ctx.reports.clone());

    info!(
        unit = %request.unit.id,
        execution_id = %request.execution_id,
        attempt = request.attempt,
        "pipeline started"
    );

    let halt = ExecutionPipeline {
        ctx: ctx.as_ref(),
        unit: &request.unit,
        cancel: &cancel,
        guard: &mut guard,
    }
    .drive()
    .await;

    match halt {
        Ok(()) => {
            info!(unit = %request.unit.id, execution_id = %request.execution_id, "pipeline succeeded");
            guard.finish(ExecutionStatus::Succeeded, None);
            PipelineOutcome::Succeeded
        }
        Err(Halt::Cancelled(stage)) => {
            info!(unit = %request.unit.id, %stage, "pipeline cancelled");
            guard.finish(
                ExecutionStatus::Cancelled,
                Some(FailureDetail {
                    stage,
                    kind: "cancelled".to_string(),
                    message: "execution cancelled".to_string(),
                    categories: Vec::new(),
                    output_tail: None,
                }),
            );
            PipelineOutcome::Cancelled
        }
        Err(Halt::Failed(failure, detail)) => {
            let status = match failure {
                PipelineFailure::DependencyNotSatisfied { .. } => ExecutionStatus::Requeued,
                _ => ExecutionStatus::Failed,
            };
            warn!(
                unit = %request.unit.id,
                execution_id = %request.execution_id,
                stage = %failure.stage(),
                error = %failure,
                "pipeline failed"
            );
            guard.finish(status, Some(detail));
            PipelineOutcome::Failed(failure)
        }
    }
}

struct ExecutionPipeline<'a> {
    ctx: &'a PipelineContext,
    unit: &'a UnitSpec,
    cancel: &'a CancelFlag,
    guard: &'a mut ReportGuard,
}

impl ExecutionPipeline<'_> {
    async fn drive(&mut self) -> Result<(), Halt> {
        self.verify_dependencies().await?;

        let build = self.run_stage(Stage::Building).await?;
        if !build.success {
            return Err(self.stage_failed(
                PipelineFailure::Build {
                    message: first_line(&build.output, "build command failed"),
                },
                &build,
            ));
        }

        let test = self.run_stage(Stage::Testing).await?;
        if !test.success {
            return Err(self.stage_failed(
                PipelineFailure::Test {
                    message: first_line(&test.output, "test command failed"),
                },
                &test,
            ));
        }

        self.quality_gate().await?;
        self.publish().await
    }

    async fn verify_dependencies(&mut self) -> Result<(), Halt> {
        let stage = Stage::VerifyingDeps;
        self.enter(stage)?;

        if self.unit.dependencies.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let check = bounded(
            self.ctx.settings.registry_timeout,
            self.ctx
                .registry
                .incomplete_dependencies(self.unit.dependencies.clone()),
        )
        .await;
        self.record(stage, started);

        match check {
            Ok(missing) if missing.is_empty() => Ok(()),
            Ok(missing) => {
                let failure = PipelineFailure::DependencyNotSatisfied { missing };
                let detail = detail_for(&failure, Vec::new(), None);
                Err(Halt::Failed(failure, detail))
            }
            Err(err) => {
                warn!(unit = %self.unit.id, error = %err, "registry dependency check failed; continuing");
                Ok(())
            }
        }
    }

    async fn quality_gate(&mut self) -> Result<(), Halt> {
        let mut result = self.run_quality().await?;
        let mut attempts = 0u32;

        while !result.success {
            let categories = self.ctx.classifier.categorize(&result);

            let Some(oracle) = self.ctx.oracle.clone() else {
                debug!(unit = %self.unit.id, "no remediation oracle configured");
                return Err(self.quality_failed(categories, attempts, &result));
            };
            if attempts >= self.ctx.settings.max_remediation_attempts {
                return Err(self.quality_failed(categories, attempts, &result));
            }

            attempts += 1;
            self.remediate(oracle.as_ref(), attempts, categories, &result)
                .await?;
            result = self.run_quality().await?;
        }

        Ok(())
    }

    async fn remediate(
        &mut self,
        oracle: &dyn RemediationOracle,
        attempt: u32,
        categories: Vec<FailureCategory>,
        failed: &StageResult,
    ) -> Result<(), Halt> {
        let stage = Stage::Remediating;
        self.enter(stage)?;

        let (prompt_key, prompt) = self.ctx.prompts.get_or_build(&categories);
        let request = RemediationRequest {
            unit_id: self.unit.id.clone(),
            unit_path: self.ctx.settings.base_dir.join(&self.unit.path),
            plan: self.unit.plan.clone(),
            attempt,
            failures: categories.clone(),
            output: failed.output_tail(OUTPUT_TAIL_LINES),
            prompt: prompt.to_string(),
        };

        info!(
            unit = %self.unit.id,
            attempt,
            prompt_key = %prompt_key,
            "requesting remediation"
        );

        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled(stage)),
            r = oracle.remediate(&request) => r,
        };
        let elapsed = started.elapsed();
        self.guard
            .report_mut()
            .stages
            .record(stage, elapsed.as_millis() as u64);

        let record = match response {
            Ok(response) => {
                info!(
                    unit = %self.unit.id,
                    attempt,
                    applied = response.was_applied(),
                    "remediation oracle responded"
                );
                RemediationAttempt {
                    attempt,
                    categories,
                    prompt_key,
                    duration_ms: elapsed.as_millis() as u64,
                    applied: response.was_applied(),
                    advisory: response.advisory().clone(),
                    error: None,
                }
            }
            Err(err) => {
                warn!(unit = %self.unit.id, attempt, error = %format!("{err:#}"), "remediation oracle failed");
                RemediationAttempt {
                    attempt,
                    categories,
                    prompt_key,
                    duration_ms: elapsed.as_millis() as u64,
                    applied: false,
                    advisory: Default::default(),
                    error: Some(format!("{err:#}")),
                }
            }
        };
        self.guard.report_mut().remediation.push(record);
        Ok(())
    }

    async fn publish(&mut self) -> Result<(), Halt> {
        let first = self.run_stage(Stage::Publishing).await?;
        if first.success {
            return Ok(());
        }

        warn!(unit = %self.unit.id, "publish failed; retrying once");
        let second = self.run_stage(Stage::Publishing).await?;
        if second.success {
            return Ok(());
        }

        Err(self.stage_failed(
            PipelineFailure::Publish {
                message: first_line(&second.output, "publish command failed"),
            },
            &second,
        ))
    }

    async fn run_quality(&mut self) -> Result<StageResult, Halt> {
        let result = self.run_stage(Stage::QualityChecking).await?;
        let metrics = self.ctx.metrics.parse(&result.output);
        let quality = &mut self.guard.report_mut().quality;
        // Keep earlier values for metrics a re-run did not print.
        quality.coverage_percent = metrics.coverage_percent.or(quality.coverage_percent);
        quality.lint_score = metrics.lint_score.or(quality.lint_score);
        quality.type_errors = metrics.type_errors.or(quality.type_errors);
        Ok(result)
    }

    /// Run one stage command, racing it against cancellation and the stage
    /// timeout. A timeout counts as the stage failing.
    async fn run_stage(&mut self, stage: Stage) -> Result<StageResult, Halt> {
        self.enter(stage)?;

        let started = Instant::now();
        let run = self.ctx.stages.run(self.unit, stage);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled(stage)),
            r = with_timeout(self.ctx.settings.stage_timeout, run) => r,
        };
        self.record(stage, started);

        match result {
            Ok(Ok(result)) => {
                debug!(unit = %self.unit.id, %stage, success = result.success, "stage finished");
                Ok(result)
            }
            Ok(Err(err)) => {
                let failure = PipelineFailure::Infrastructure {
                    stage,
                    message: format!("{err:#}"),
                };
                let detail = detail_for(&failure, Vec::new(), None);
                Err(Halt::Failed(failure, detail))
            }
            Err(limit) => {
                warn!(unit = %self.unit.id, %stage, timeout = ?limit, "stage timed out");
                Ok(StageResult::failed(format!("{stage} timed out after {limit:?}")))
            }
        }
    }

    /// Stage boundary: cancellation check plus bookkeeping.
    fn enter(&mut self, stage: Stage) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled(stage));
        }
        debug!(unit = %self.unit.id, %stage, "entering stage");
        self.guard.enter_stage(stage);
        Ok(())
    }

    fn record(&mut self, stage: Stage, started: Instant) {
        self.guard
            .report_mut()
            .stages
            .record(stage, started.elapsed().as_millis() as u64);
    }

    fn stage_failed(&self, failure: PipelineFailure, result: &StageResult) -> Halt {
        let detail = detail_for(&failure, Vec::new(), Some(result.output_tail(OUTPUT_TAIL_LINES)));
        Halt::Failed(failure, detail)
    }

    fn quality_failed(
        &self,
        categories: Vec<FailureCategory>,
        attempts: u32,
        result: &StageResult,
    ) -> Halt {
        let failure = PipelineFailure::Quality {
            categories: categories.clone(),
            attempts,
        };
        let detail = detail_for(&failure, categories, Some(result.output_tail(OUTPUT_TAIL_LINES)));
        Halt::Failed(failure, detail)
    }
}

fn detail_for(
    failure: &PipelineFailure,
    categories: Vec<FailureCategory>,
    output_tail: Option<String>,
) -> FailureDetail {
    FailureDetail {
        stage: failure.stage(),
        kind: failure.kind().to_string(),
        message: failure.to_string(),
        categories,
        output_tail: output_tail.filter(|t| !t.is_empty()),
    }
}

async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T, Duration>
where
    F: Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
        None => Ok(fut.await),
    }
}

fn first_line(output: &str, fallback: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}
