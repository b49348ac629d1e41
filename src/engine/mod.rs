// src/engine/mod.rs

//! Orchestration engine for builddag.
//!
//! This module ties together:
//! - the internal unit queue and retry bookkeeping
//! - the control state machine (running, paused, draining, stopped)
//! - checkpointing
//! - the main runtime event loop that reacts to:
//!   - units arriving from the manifest or the work queue
//!   - pipeline completions and retry timers
//!   - control operations and status queries
//!   - shutdown signals
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::ConfigFile;
use crate::dag::UnitSpec;
use crate::exec::PipelineOutcome;
use crate::types::{ExecutionId, UnitId, UnitStatus};

pub mod checkpoint;
pub mod control;
pub mod core;
pub mod event_handlers;
pub mod queue;
pub mod retry;
pub mod runtime;

pub use checkpoint::{CheckpointStore, OrchestratorSnapshot};
pub use control::{ControlHandle, Progress};
pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use queue::UnitQueue;
pub use retry::{Backoff, RetryBook};
pub use runtime::{Runtime, RuntimeSettings};

/// Options for the core state machine.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Exit once nothing is running, no retry is pending and no queued unit
    /// can start (used for `--once`).
    pub exit_when_idle: bool,
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Delay before re-queuing a unit whose dependencies the registry did not
    /// confirm.
    pub requeue_delay: Duration,
    /// Checkpoint after this many terminal results.
    pub checkpoint_every: u32,
    pub concurrency: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            exit_when_idle: false,
            max_retries: 3,
            backoff: Backoff::default(),
            requeue_delay: Duration::from_secs(1),
            checkpoint_every: 10,
            concurrency: 4,
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(cfg: &ConfigFile, exit_when_idle: bool) -> Self {
        Self {
            exit_when_idle,
            max_retries: cfg.orchestrator.max_retries,
            backoff: Backoff {
                policy: cfg.orchestrator.backoff,
                base: cfg.timings.backoff_base,
                max: cfg.timings.backoff_max,
            },
            requeue_delay: cfg.timings.requeue_delay,
            checkpoint_every: cfg.orchestrator.checkpoint_every,
            concurrency: cfg.orchestrator.concurrency,
        }
    }
}

/// Where a batch of units came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeSource {
    /// The config manifest or a `ControlHandle::enqueue` call.
    Manual,
    /// A `fetch_ready` poll. `epoch` is the completion epoch the poll started
    /// in; the registry vouches for dependencies it reports as ready.
    Registry { epoch: u64 },
}

/// Operator controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Drain,
    EmergencyStop,
    AdjustConcurrency(usize),
}

/// Read-only questions, answered by the runtime without stepping the core.
#[derive(Debug)]
pub enum StatusQuery {
    Progress(oneshot::Sender<Progress>),
    Failed(oneshot::Sender<Vec<UnitId>>),
    Active(oneshot::Sender<Vec<(UnitId, ExecutionId)>>),
    UnitStatus(UnitId, oneshot::Sender<Option<UnitStatus>>),
}

/// Events flowing into the runtime mailbox.
#[derive(Debug)]
pub enum RuntimeEvent {
    UnitsArrived {
        units: Vec<UnitSpec>,
        source: IntakeSource,
    },
    /// A pipeline reached a terminal state.
    PipelineFinished {
        unit: UnitId,
        execution_id: ExecutionId,
        outcome: PipelineOutcome,
    },
    /// A retry or requeue delay elapsed.
    RetryDue { unit: UnitId },
    Control(ControlCommand),
    Query(StatusQuery),
    /// The checkpoint interval elapsed.
    CheckpointDue,
    /// Immediate shutdown without cancelling anything (channel owner going away).
    ShutdownRequested,
}
