use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use builddag::engine::RuntimeEvent;
use builddag::exec::{BackendFuture, LaunchRequest, PipelineBackend, PipelineOutcome};
use builddag::types::ExecutionId;
use tokio::sync::mpsc;

/// A fake pipeline backend that:
/// - records every launch and cancel
/// - reports `PipelineFinished` with a scripted outcome per unit
///   (default `Succeeded`; the last scripted outcome repeats)
/// - keeps `held` units running until they are cancelled.
pub struct FakeBackend {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    outcomes: HashMap<String, VecDeque<PipelineOutcome>>,
    held: HashSet<String>,
    holding: HashMap<ExecutionId, String>,
    launched: Arc<Mutex<Vec<LaunchRequest>>>,
    cancelled: Arc<Mutex<Vec<ExecutionId>>>,
}

impl FakeBackend {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            outcomes: HashMap::new(),
            held: HashSet::new(),
            holding: HashMap::new(),
            launched: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_outcomes(mut self, unit: &str, outcomes: Vec<PipelineOutcome>) -> Self {
        self.outcomes.insert(unit.to_string(), outcomes.into());
        self
    }

    /// Launches of `unit` never finish on their own.
    pub fn hold(mut self, unit: &str) -> Self {
        self.held.insert(unit.to_string());
        self
    }

    /// Shared view of every launch request, in launch order.
    pub fn launched(&self) -> Arc<Mutex<Vec<LaunchRequest>>> {
        Arc::clone(&self.launched)
    }

    pub fn cancelled(&self) -> Arc<Mutex<Vec<ExecutionId>>> {
        Arc::clone(&self.cancelled)
    }

    fn next_outcome(&mut self, unit: &str) -> PipelineOutcome {
        match self.outcomes.get_mut(unit) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(PipelineOutcome::Succeeded),
            Some(queue) => queue.front().cloned().unwrap_or(PipelineOutcome::Succeeded),
            None => PipelineOutcome::Succeeded,
        }
    }

    fn finish(&self, unit: String, execution_id: ExecutionId, outcome: PipelineOutcome) {
        // Sent from a task so a full mailbox never blocks the runtime.
        let tx = self.runtime_tx.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(RuntimeEvent::PipelineFinished {
                    unit,
                    execution_id,
                    outcome,
                })
                .await;
        });
    }
}

impl PipelineBackend for FakeBackend {
    fn launch(&mut self, requests: Vec<LaunchRequest>) -> BackendFuture<'_> {
        Box::pin(async move {
            for request in requests {
                self.launched.lock().unwrap().push(request.clone());

                let unit = request.unit.id.clone();
                if self.held.contains(&unit) {
                    self.holding.insert(request.execution_id, unit);
                    continue;
                }
                let outcome = self.next_outcome(&unit);
                self.finish(unit, request.execution_id, outcome);
            }
            Ok(())
        })
    }

    fn cancel(&mut self, executions: Vec<ExecutionId>) -> BackendFuture<'_> {
        Box::pin(async move {
            for id in executions {
                self.cancelled.lock().unwrap().push(id.clone());
                if let Some(unit) = self.holding.remove(&id) {
                    self.finish(unit, id, PipelineOutcome::Cancelled);
                }
            }
            Ok(())
        })
    }

    fn shutdown(&mut self, _grace: Duration) -> BackendFuture<'_> {
        Box::pin(async move {
            self.holding.clear();
            Ok(())
        })
    }
}
