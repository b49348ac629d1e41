// src/exec/mod.rs

//! Pipeline execution layer.
//!
//! - [`pipeline`] is the per-unit state machine (verify, build, test,
//!   quality gate with remediation, publish).
//! - [`stages`] defines the `StageRunner` seam and the shell implementation.
//! - [`quality`] classifies quality failures and parses metrics.
//! - [`remediation`] defines the oracle seam, its response type and the
//!   shared prompt cache.
//! - [`backend`] provides the `PipelineBackend` trait and the tokio backend
//!   the runtime uses in production, which tests can replace with a fake.
//! - [`cancel`] is the per-execution cancellation flag.

pub mod backend;
pub mod cancel;
pub mod pipeline;
pub mod quality;
pub mod remediation;
pub mod stages;

pub use backend::{BackendFuture, PipelineBackend, TokioPipelineBackend};
pub use cancel::CancelFlag;
pub use pipeline::{
    run_pipeline, LaunchRequest, PipelineContext, PipelineFailure, PipelineOutcome,
    PipelineSettings,
};
pub use quality::{MetricsParser, QualityClassifier};
pub use remediation::{
    PromptCache, RemediationOracle, RemediationRequest, RemediationResponse, ShellOracle,
};
pub use stages::{ShellStageRunner, StageCommands, StageResult, StageRunner, StructuredFailure};
