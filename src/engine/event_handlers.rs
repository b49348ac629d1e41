// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dag::UnitSpec;
use crate::engine::core::CoreRuntime;
use crate::engine::{ControlCommand, IntakeSource};
use crate::engine::checkpoint::OrchestratorSnapshot;
use crate::exec::{LaunchRequest, PipelineFailure, PipelineOutcome};
use crate::types::{ControlState, ExecutionId, UnitId, UnitStatus};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Start these pipelines.
    Launch(Vec<LaunchRequest>),
    /// Send `RetryDue` for `unit` after `delay`.
    ScheduleRetry { unit: UnitId, delay: Duration },
    /// Push a status change to the work queue.
    ReportStatus {
        unit: UnitId,
        status: UnitStatus,
        detail: Option<String>,
    },
    /// Set the cancel flags of these executions.
    CancelExecutions(Vec<ExecutionId>),
    /// Persist this snapshot.
    Checkpoint(Box<OrchestratorSnapshot>),
    /// Remove the checkpoint file; the run ended deliberately.
    DiscardCheckpoint,
    /// Ask the poller to fetch from the work queue now.
    RequestPoll { epoch: u64 },
    /// Request that the process exits.
    RequestExit,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub fn proceed(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }

    pub fn stop(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: false,
        }
    }
}

impl CoreRuntime {
    /// Merge arriving units into the queue.
    ///
    /// Units already queued, running, waiting on a retry, completed or failed
    /// are ignored. Units whose addition would close a cycle are dropped.
    /// For registry intake, dependencies the orchestrator has never heard of
    /// are taken as completed elsewhere: the registry only reports a unit as
    /// ready once its dependencies are done.
    pub(super) fn handle_intake(&mut self, units: Vec<UnitSpec>, source: IntakeSource) -> CoreStep {
        let mut commands = Vec::new();

        if let IntakeSource::Registry { epoch } = source {
            if epoch >= self.completion_epoch {
                self.intake_settled = true;
            }
        }

        if !self.control.accepts_intake() {
            if !units.is_empty() {
                warn!(
                    count = units.len(),
                    control_state = ?self.control,
                    "rejecting intake while not accepting work"
                );
            }
            return self.finish_step(commands);
        }

        let vouched = matches!(source, IntakeSource::Registry { .. });
        let mut fresh: Vec<UnitSpec> = Vec::new();

        for spec in units {
            let id = spec.id.clone();
            if self.graph.contains(&id) {
                if self.is_terminal(&id)
                    || self.active.contains_key(&id)
                    || self.queue.contains(&id)
                    || self.retries.is_waiting(&id)
                {
                    debug!(unit = %id, "intake ignored; unit already tracked");
                    continue;
                }
                // Known but idle (e.g. its last execution was cancelled).
                if self.queue.push(id.clone()) && self.dependencies_satisfied(&id) {
                    commands.push(queued(id));
                }
                continue;
            }
            if self.completed.contains(&id) {
                debug!(unit = %id, "intake ignored; unit completed externally");
                continue;
            }
            if fresh.iter().any(|s| s.id == id) {
                continue;
            }
            fresh.push(spec);
        }

        if vouched {
            for spec in &fresh {
                for dep in &spec.dependencies {
                    let known = self.graph.contains(dep) || fresh.iter().any(|s| &s.id == dep);
                    if !known && self.completed.insert(dep.clone()) {
                        debug!(unit = %spec.id, dependency = %dep, "dependency vouched for by registry");
                        self.external_completed.insert(dep.clone());
                    }
                }
            }
        }

        let accepted = self.register(fresh);
        for id in accepted {
            if self.queue.push(id.clone()) && self.dependencies_satisfied(&id) {
                commands.push(queued(id));
            }
        }

        commands.extend(self.tick());
        self.finish_step(commands)
    }

    /// Add units to the graph, dropping any that would close a cycle.
    fn register(&mut self, fresh: Vec<UnitSpec>) -> Vec<UnitId> {
        if fresh.is_empty() {
            return Vec::new();
        }

        let ids: Vec<UnitId> = fresh.iter().map(|s| s.id.clone()).collect();
        match self.graph.with_units(fresh.clone()) {
            Ok(graph) => {
                self.graph = graph;
                info!(count = ids.len(), "units accepted");
                ids
            }
            Err(err) => {
                debug!(error = %err, "batch intake rejected; adding units one by one");
                let mut accepted = Vec::new();
                for spec in fresh {
                    let id = spec.id.clone();
                    match self.graph.with_unit(spec) {
                        Ok(graph) => {
                            self.graph = graph;
                            accepted.push(id);
                        }
                        Err(err) => warn!(unit = %id, error = %err, "unit rejected at intake"),
                    }
                }
                accepted
            }
        }
    }

    pub(super) fn handle_completion(
        &mut self,
        unit: UnitId,
        execution_id: ExecutionId,
        outcome: PipelineOutcome,
    ) -> CoreStep {
        match self.active.get(&unit) {
            Some(a) if a.execution_id == execution_id => {
                self.active.remove(&unit);
            }
            _ => {
                debug!(unit = %unit, %execution_id, "ignoring completion of stale execution");
                return CoreStep::proceed(Vec::new());
            }
        }

        self.completion_epoch += 1;
        self.intake_settled = false;

        let mut commands = Vec::new();

        match outcome {
            PipelineOutcome::Succeeded => {
                info!(unit = %unit, "unit completed");
                self.retries.clear(&unit);
                self.completed.insert(unit.clone());
                let unblocked: Vec<UnitId> = self
                    .graph
                    .dependents_of(&unit)
                    .iter()
                    .filter(|d| self.queue.contains(d) && self.dependencies_satisfied(d))
                    .cloned()
                    .collect();
                commands.push(CoreCommand::ReportStatus {
                    unit,
                    status: UnitStatus::Completed,
                    detail: None,
                });
                commands.extend(unblocked.into_iter().map(queued));
                self.terminal_since_checkpoint += 1;
            }
            PipelineOutcome::Failed(PipelineFailure::DependencyNotSatisfied { missing }) => {
                let delay = self.options.requeue_delay;
                info!(unit = %unit, missing = ?missing, ?delay, "dependencies not confirmed; requeuing");
                self.retries.schedule(&unit, delay);
                commands.push(CoreCommand::ScheduleRetry {
                    unit: unit.clone(),
                    delay,
                });
                commands.push(CoreCommand::ReportStatus {
                    unit,
                    status: UnitStatus::Pending,
                    detail: Some(format!("waiting for {}", missing.join(", "))),
                });
            }
            PipelineOutcome::Failed(failure) if failure.is_retryable() => {
                let attempts = self.retries.record_failure(&unit);
                if attempts < self.options.max_retries {
                    let delay = self.options.backoff.delay(attempts);
                    warn!(unit = %unit, attempts, ?delay, error = %failure, "retryable failure; backing off");
                    self.retries.schedule(&unit, delay);
                    commands.push(CoreCommand::ScheduleRetry {
                        unit: unit.clone(),
                        delay,
                    });
                    commands.push(CoreCommand::ReportStatus {
                        unit,
                        status: UnitStatus::Pending,
                        detail: Some(format!("retry {attempts} after: {failure}")),
                    });
                } else {
                    warn!(unit = %unit, attempts, error = %failure, "retries exhausted");
                    commands.push(self.mark_failed(unit, failure.to_string()));
                }
            }
            PipelineOutcome::Failed(failure) => {
                warn!(unit = %unit, error = %failure, "unit failed");
                commands.push(self.mark_failed(unit, failure.to_string()));
            }
            PipelineOutcome::Cancelled => {
                info!(unit = %unit, "execution cancelled");
                if self.control.accepts_intake()
                    && self.queue.push(unit.clone())
                    && self.dependencies_satisfied(&unit)
                {
                    commands.push(queued(unit));
                }
            }
        }

        if self.control == ControlState::Draining && self.active.is_empty() {
            return self.terminate(commands);
        }

        commands.extend(self.tick());

        if self.terminal_since_checkpoint >= self.options.checkpoint_every {
            commands.push(self.checkpoint());
        }

        commands.push(CoreCommand::RequestPoll {
            epoch: self.completion_epoch,
        });

        self.finish_step(commands)
    }

    pub(super) fn handle_retry_due(&mut self, unit: UnitId) -> CoreStep {
        if !self.retries.mark_due(&unit) {
            debug!(unit = %unit, "ignoring stale retry timer");
            return CoreStep::proceed(Vec::new());
        }

        let mut commands = Vec::new();
        if self.is_terminal(&unit) || !self.control.accepts_intake() {
            debug!(unit = %unit, control_state = ?self.control, "retry due but not re-queued");
            return self.finish_step(commands);
        }

        debug!(unit = %unit, attempts = self.retries.attempts(&unit), "retry due; re-queuing");
        if self.queue.push(unit.clone()) && self.dependencies_satisfied(&unit) {
            commands.push(queued(unit));
        }
        commands.extend(self.tick());
        self.finish_step(commands)
    }

    pub(super) fn handle_control(&mut self, command: ControlCommand) -> CoreStep {
        if self.control.is_terminal() {
            return CoreStep::stop(Vec::new());
        }

        match command {
            ControlCommand::Pause => {
                if self.control == ControlState::Running {
                    info!("pausing; running pipelines continue");
                    self.control = ControlState::Paused;
                }
                CoreStep::proceed(Vec::new())
            }
            ControlCommand::Resume => {
                if self.control == ControlState::Paused {
                    info!("resuming");
                    self.control = ControlState::Running;
                }
                let commands = self.tick();
                self.finish_step(commands)
            }
            ControlCommand::Drain => {
                if !self.control.accepts_intake() {
                    return CoreStep::proceed(Vec::new());
                }
                info!(active = self.active.len(), "draining; no new launches");
                self.control = ControlState::Draining;
                if self.active.is_empty() {
                    self.terminate(Vec::new())
                } else {
                    CoreStep::proceed(Vec::new())
                }
            }
            ControlCommand::EmergencyStop => {
                let ids: Vec<ExecutionId> =
                    self.active.values().map(|a| a.execution_id.clone()).collect();
                warn!(active = ids.len(), "emergency stop; cancelling all executions");
                self.control = ControlState::EmergencyStopped;
                let mut commands = Vec::new();
                if !ids.is_empty() {
                    commands.push(CoreCommand::CancelExecutions(ids));
                }
                commands.push(CoreCommand::DiscardCheckpoint);
                commands.push(CoreCommand::RequestExit);
                CoreStep::stop(commands)
            }
            ControlCommand::AdjustConcurrency(limit) => {
                let limit = limit.max(1);
                info!(from = self.concurrency_limit, to = limit, "adjusting concurrency");
                self.concurrency_limit = limit;
                let commands = self.tick();
                self.finish_step(commands)
            }
        }
    }

    pub(super) fn handle_checkpoint_due(&mut self) -> CoreStep {
        if self.control.is_terminal() || self.graph.is_empty() {
            return CoreStep::proceed(Vec::new());
        }
        CoreStep::proceed(vec![self.checkpoint()])
    }

    fn checkpoint(&mut self) -> CoreCommand {
        self.terminal_since_checkpoint = 0;
        CoreCommand::Checkpoint(Box::new(self.snapshot()))
    }

    fn mark_failed(&mut self, unit: UnitId, detail: String) -> CoreCommand {
        self.retries.clear(&unit);
        self.failed.insert(unit.clone());
        self.terminal_since_checkpoint += 1;
        let blocked = self.graph.transitive_dependents(&unit);
        if !blocked.is_empty() {
            info!(unit = %unit, blocked = ?blocked, "dependents stay pending");
        }
        CoreCommand::ReportStatus {
            unit,
            status: UnitStatus::Failed,
            detail: Some(detail),
        }
    }

    fn terminate(&mut self, mut commands: Vec<CoreCommand>) -> CoreStep {
        info!("drain complete; terminating");
        self.control = ControlState::Terminated;
        commands.push(CoreCommand::DiscardCheckpoint);
        commands.push(CoreCommand::RequestExit);
        CoreStep::stop(commands)
    }

    /// Append an exit request when running with `exit_when_idle` and there is
    /// nothing left to do.
    fn finish_step(&mut self, mut commands: Vec<CoreCommand>) -> CoreStep {
        if self.options.exit_when_idle && self.intake_settled && self.is_idle() {
            info!("idle with nothing left to launch; exiting");
            self.control = ControlState::Terminated;
            commands.push(CoreCommand::DiscardCheckpoint);
            commands.push(CoreCommand::RequestExit);
            return CoreStep::stop(commands);
        }
        CoreStep::proceed(commands)
    }
}

fn queued(unit: UnitId) -> CoreCommand {
    CoreCommand::ReportStatus {
        unit,
        status: UnitStatus::Queued,
        detail: None,
    }
}
