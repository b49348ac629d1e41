// src/report/mod.rs

//! Execution reports and their suite-level aggregation.
//!
//! Pipelines own their [`ExecutionReport`] through a [`ReportGuard`] and send
//! it over an unbounded channel when they end. The [`ReportAggregator`]
//! consumes that stream, writes one JSON file per execution, and produces a
//! [`SuiteSummary`] when the suite finishes.

pub mod aggregator;
pub mod guard;
pub mod model;
pub mod writer;

pub use aggregator::{spawn_aggregator, ReportAggregator, SuiteOutcome, SuiteSummary};
pub use guard::ReportGuard;
pub use model::{
    ExecutionReport, ExecutionStatus, FailureDetail, QualityMetrics, RemediationAttempt,
    StageTimings,
};
pub use writer::ReportWriter;
