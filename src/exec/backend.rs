// src/exec/backend.rs

//! Pluggable pipeline backend.
//!
//! The runtime talks to a `PipelineBackend` instead of spawning pipelines
//! itself. Tests can swap in a backend that records launches and emits
//! `PipelineFinished` events directly.
//!
//! [`TokioPipelineBackend`] runs each pipeline as its own tokio task and keeps
//! the live handles (cancel flag, abort handle) keyed by [`ExecutionId`]. The
//! orchestrator core only ever sees the ids.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::engine::RuntimeEvent;
use crate::exec::cancel::CancelFlag;
use crate::exec::pipeline::{
    LaunchRequest, PipelineContext, PipelineFailure, PipelineOutcome, run_pipeline,
};
use crate::types::{ExecutionId, Stage, UnitId};

/// Boxed future returned by backend operations.
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// How pipelines are started and stopped.
pub trait PipelineBackend: Send {
    /// Start one pipeline per request. Each must eventually produce exactly
    /// one `RuntimeEvent::PipelineFinished`.
    fn launch(&mut self, requests: Vec<LaunchRequest>) -> BackendFuture<'_>;

    /// Ask the given executions to stop at their next stage boundary.
    fn cancel(&mut self, executions: Vec<ExecutionId>) -> BackendFuture<'_>;

    /// Wait up to `grace` for running pipelines to finish, then abort the rest.
    fn shutdown(&mut self, grace: Duration) -> BackendFuture<'_>;
}

struct RunningPipeline {
    unit: UnitId,
    cancel: CancelFlag,
    abort: AbortHandle,
}

type Registry = Arc<Mutex<HashMap<ExecutionId, RunningPipeline>>>;

/// Production backend: one tokio task per pipeline plus a small supervisor
/// task that turns a panic into an infrastructure failure.
pub struct TokioPipelineBackend {
    ctx: Arc<PipelineContext>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    running: Registry,
    /// One supervisor per launch; each ends after reporting its pipeline.
    supervisors: JoinSet<()>,
}

impl TokioPipelineBackend {
    pub fn new(ctx: Arc<PipelineContext>, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            ctx,
            runtime_tx,
            running: Arc::new(Mutex::new(HashMap::new())),
            supervisors: JoinSet::new(),
        }
    }

    fn spawn_one(&mut self, request: LaunchRequest) {
        while self.supervisors.try_join_next().is_some() {}


        let unit = request.unit.id.clone();
        let execution_id = request.execution_id.clone();

        let mut running = lock(&self.running);

        if running.values().any(|p| p.unit == unit) {
            // The core never launches a unit twice; reaching this means its
            // bookkeeping and ours disagree.
            error!(unit = %unit, execution_id = %execution_id, "unit already has a live pipeline");
            let tx = self.runtime_tx.clone();
            self.supervisors.spawn(async move {
                let outcome = PipelineOutcome::Failed(PipelineFailure::Infrastructure {
                    stage: Stage::VerifyingDeps,
                    message: "unit already has a live pipeline".to_string(),
                });
                let _ = tx
                    .send(RuntimeEvent::PipelineFinished {
                        unit,
                        execution_id,
                        outcome,
                    })
                    .await;
            });
            return;
        }

        let cancel = CancelFlag::new();
        let pipeline = tokio::spawn(run_pipeline(
            Arc::clone(&self.ctx),
            request,
            cancel.clone(),
        ));

        running.insert(
            execution_id.clone(),
            RunningPipeline {
                unit: unit.clone(),
                cancel,
                abort: pipeline.abort_handle(),
            },
        );
        drop(running);

        let registry = Arc::clone(&self.running);
        let tx = self.runtime_tx.clone();
        self.supervisors.spawn(async move {
            let outcome = match pipeline.await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_cancelled() => {
                    debug!(unit = %unit, execution_id = %execution_id, "pipeline task aborted");
                    PipelineOutcome::Cancelled
                }
                Err(join_err) => {
                    error!(
                        unit = %unit,
                        execution_id = %execution_id,
                        error = %join_err,
                        "pipeline task panicked"
                    );
                    PipelineOutcome::Failed(PipelineFailure::Infrastructure {
                        stage: Stage::VerifyingDeps,
                        message: format!("pipeline task panicked: {join_err}"),
                    })
                }
            };

            lock(&registry).remove(&execution_id);

            if tx
                .send(RuntimeEvent::PipelineFinished {
                    unit: unit.clone(),
                    execution_id,
                    outcome,
                })
                .await
                .is_err()
            {
                debug!(unit = %unit, "runtime gone; dropping pipeline completion");
            }
        });
    }
}

impl PipelineBackend for TokioPipelineBackend {
    fn launch(&mut self, requests: Vec<LaunchRequest>) -> BackendFuture<'_> {
        for request in requests {
            info!(
                unit = %request.unit.id,
                execution_id = %request.execution_id,
                attempt = request.attempt,
                "launching pipeline"
            );
            self.spawn_one(request);
        }
        Box::pin(async { Ok(()) })
    }

    fn cancel(&mut self, executions: Vec<ExecutionId>) -> BackendFuture<'_> {
        let running = lock(&self.running);
        for id in &executions {
            match running.get(id) {
                Some(p) => {
                    info!(unit = %p.unit, execution_id = %id, "cancelling pipeline");
                    p.cancel.cancel();
                }
                None => debug!(execution_id = %id, "cancel requested for unknown execution"),
            }
        }
        drop(running);
        Box::pin(async { Ok(()) })
    }

    fn shutdown(&mut self, grace: Duration) -> BackendFuture<'_> {
        Box::pin(async move {
            let drained = tokio::time::timeout(grace, async {
                while self.supervisors.join_next().await.is_some() {}
            })
            .await;
            if drained.is_ok() {
                return Ok(());
            }

            let running = lock(&self.running);
            warn!(count = running.len(), "aborting pipelines still running at shutdown");
            for p in running.values() {
                p.cancel.cancel();
                p.abort.abort();
            }
            Ok(())
        })
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<ExecutionId, RunningPipeline>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}
