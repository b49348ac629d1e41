// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous "core runtime" that consumes
//! [`RuntimeEvent`]s and produces:
//! - an updated orchestrator state
//! - a list of [`CoreCommand`]s describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from the mailbox
//! - launching and cancelling pipelines through the backend
//! - registry calls, timers, checkpoint files and Ctrl-C
//!
//! The core has no channels, no tokio types and performs no IO, so it can be
//! unit tested by feeding it events directly.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::dag::DependencyGraph;
use crate::engine::checkpoint::{InFlight, OrchestratorSnapshot, RetryEntry, SNAPSHOT_VERSION};
use crate::engine::control::Progress;
use crate::engine::event_handlers::{CoreCommand, CoreStep};
use crate::engine::queue::UnitQueue;
use crate::engine::retry::RetryBook;
use crate::engine::{IntakeSource, RuntimeEvent, RuntimeOptions, StatusQuery};
use crate::errors::Result;
use crate::exec::LaunchRequest;
use crate::report::SuiteOutcome;
use crate::types::{ControlState, ExecutionId, UnitId, UnitStatus};

/// A unit with a live pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveExecution {
    pub execution_id: ExecutionId,
    pub attempt: u32,
}

/// Orchestrator state.
///
/// Every unit the core knows about lives in `graph`. A unit's status is
/// derived from which of `completed`, `failed`, `active` and `queue` holds it;
/// a known unit in none of them is pending.
#[derive(Debug)]
pub struct CoreRuntime {
    pub(super) graph: DependencyGraph,
    pub(super) queue: UnitQueue,
    pub(super) active: BTreeMap<UnitId, ActiveExecution>,
    pub(super) retries: RetryBook,
    pub(super) completed: BTreeSet<UnitId>,
    /// Completed units vouched for by the registry rather than built here.
    pub(super) external_completed: BTreeSet<UnitId>,
    pub(super) failed: BTreeSet<UnitId>,
    pub(super) concurrency_limit: usize,
    pub(super) control: ControlState,
    pub(super) options: RuntimeOptions,
    pub(super) terminal_since_checkpoint: u32,
    /// Bumped on every pipeline completion; see [`IntakeSource::Registry`].
    pub(super) completion_epoch: u64,
    /// Whether a registry poll has finished since the last completion.
    pub(super) intake_settled: bool,
}

impl CoreRuntime {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            graph: DependencyGraph::default(),
            queue: UnitQueue::new(),
            active: BTreeMap::new(),
            retries: RetryBook::new(),
            completed: BTreeSet::new(),
            external_completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            concurrency_limit: options.concurrency.max(1),
            control: ControlState::Running,
            options,
            terminal_since_checkpoint: 0,
            completion_epoch: 0,
            intake_settled: false,
        }
    }

    /// Rebuild state from a checkpoint.
    ///
    /// Returns the core plus the commands that get it moving again: retries
    /// still inside their delay are rescheduled for the remaining time, and
    /// the queue is ticked. Units that were running when the snapshot was
    /// taken are queued ahead of the saved queue.
    pub fn restore(
        snapshot: OrchestratorSnapshot,
        options: RuntimeOptions,
    ) -> Result<(Self, Vec<CoreCommand>)> {
        let mut core = Self::new(options);
        core.graph = DependencyGraph::build(snapshot.units)?;
        core.completed = snapshot.completed.into_iter().collect();
        core.external_completed = snapshot.external_completed.into_iter().collect();
        core.failed = snapshot.failed.into_iter().collect();
        core.concurrency_limit = snapshot.concurrency_limit.max(1);
        core.control = match snapshot.control_state {
            ControlState::Paused => ControlState::Paused,
            _ => ControlState::Running,
        };

        let mut commands = Vec::new();

        for flight in snapshot.in_flight {
            if core.is_terminal(&flight.unit) || !core.graph.contains(&flight.unit) {
                continue;
            }
            info!(unit = %flight.unit, execution_id = %flight.execution_id, "re-queuing interrupted execution");
            core.queue.push(flight.unit);
        }
        for unit in snapshot.queue {
            if !core.is_terminal(&unit) && core.graph.contains(&unit) {
                core.queue.push(unit);
            }
        }

        let now = Utc::now();
        for RetryEntry { unit, mut state } in snapshot.retries {
            if core.is_terminal(&unit) || !core.graph.contains(&unit) {
                continue;
            }
            match state.next_retry_at {
                Some(at) if at > now => {
                    let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
                    commands.push(CoreCommand::ScheduleRetry {
                        unit: unit.clone(),
                        delay: remaining,
                    });
                }
                Some(_) => {
                    state.next_retry_at = None;
                    core.queue.push(unit.clone());
                }
                None => {}
            }
            core.retries.insert(unit, state);
        }

        info!(
            completed = core.completed.len(),
            failed = core.failed.len(),
            queued = core.queue.len(),
            control_state = ?core.control,
            "restored orchestrator state from checkpoint"
        );

        commands.extend(core.tick());
        Ok((core, commands))
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::UnitsArrived { units, source } => self.handle_intake(units, source),
            RuntimeEvent::PipelineFinished {
                unit,
                execution_id,
                outcome,
            } => self.handle_completion(unit, execution_id, outcome),
            RuntimeEvent::RetryDue { unit } => self.handle_retry_due(unit),
            RuntimeEvent::Control(command) => self.handle_control(command),
            RuntimeEvent::CheckpointDue => self.handle_checkpoint_due(),
            RuntimeEvent::Query(query) => {
                self.answer(query);
                CoreStep::proceed(Vec::new())
            }
            RuntimeEvent::ShutdownRequested => CoreStep::stop(Vec::new()),
        }
    }

    /// Reply to a status query.
    pub fn answer(&self, query: StatusQuery) {
        // A dropped receiver only means the caller stopped waiting.
        match query {
            StatusQuery::Progress(tx) => {
                let _ = tx.send(self.progress());
            }
            StatusQuery::Failed(tx) => {
                let _ = tx.send(self.failed());
            }
            StatusQuery::Active(tx) => {
                let _ = tx.send(self.active());
            }
            StatusQuery::UnitStatus(unit, tx) => {
                let _ = tx.send(self.unit_status(&unit));
            }
        }
    }

    /// Launch queued units whose dependencies are complete, ordered by
    /// (layer, arrival), until the concurrency limit is reached.
    pub(super) fn tick(&mut self) -> Vec<CoreCommand> {
        if self.control != ControlState::Running {
            return Vec::new();
        }

        let free = self.concurrency_limit.saturating_sub(self.active.len());
        if free == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(usize, u64, UnitId)> = self
            .queue
            .iter()
            .filter(|(id, _)| !self.active.contains_key(*id))
            .filter(|(id, _)| self.dependencies_satisfied(id))
            .map(|(id, seq)| (self.graph.layer(id).unwrap_or(0), seq, id.to_string()))
            .collect();
        candidates.sort();
        candidates.truncate(free);

        if candidates.is_empty() {
            return Vec::new();
        }

        let mut launches = Vec::with_capacity(candidates.len());
        let mut statuses = Vec::with_capacity(candidates.len());

        for (_, _, id) in candidates {
            let Some(spec) = self.graph.spec(&id).cloned() else {
                // Queue entries are always registered in the graph.
                warn!(unit = %id, "queued unit missing from graph; dropping");
                self.queue.remove(&id);
                continue;
            };

            let waited = self.queue.remove(&id).unwrap_or_default();
            let attempt = self.retries.attempts(&id) + 1;
            let execution_id = ExecutionId::generate();

            debug!(unit = %id, %execution_id, attempt, "unit ready; launching");

            self.active.insert(
                id.clone(),
                ActiveExecution {
                    execution_id: execution_id.clone(),
                    attempt,
                },
            );
            statuses.push(CoreCommand::ReportStatus {
                unit: id,
                status: UnitStatus::Running,
                detail: None,
            });
            launches.push(LaunchRequest {
                unit: spec,
                execution_id,
                attempt,
                waited,
            });
        }

        let mut commands = vec![CoreCommand::Launch(launches)];
        commands.extend(statuses);
        commands
    }

    /// True when every dependency of `id` is completed.
    pub(super) fn dependencies_satisfied(&self, id: &str) -> bool {
        self.graph
            .spec(id)
            .is_some_and(|spec| spec.dependencies.iter().all(|d| self.completed.contains(d)))
    }

    pub(super) fn is_terminal(&self, id: &str) -> bool {
        self.completed.contains(id) || self.failed.contains(id)
    }

    /// Nothing running, nothing waiting on a timer, and no queued unit can
    /// start. Only meaningful once intake has settled.
    pub(super) fn is_idle(&self) -> bool {
        self.active.is_empty()
            && self.retries.waiting_count() == 0
            && !self
                .queue
                .iter()
                .any(|(id, _)| self.dependencies_satisfied(id))
    }

    /// Snapshot for checkpointing.
    pub fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            units: self.graph.units().cloned().collect(),
            queue: self.queue.ids(),
            in_flight: self
                .active
                .iter()
                .map(|(unit, a)| InFlight {
                    unit: unit.clone(),
                    execution_id: a.execution_id.clone(),
                    attempt: a.attempt,
                })
                .collect(),
            retries: self
                .retries
                .iter()
                .map(|(unit, state)| RetryEntry {
                    unit: unit.clone(),
                    state: state.clone(),
                })
                .collect(),
            completed: self.completed.iter().cloned().collect(),
            external_completed: self.external_completed.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
            concurrency_limit: self.concurrency_limit,
            control_state: self.control,
        }
    }

    pub fn control_state(&self) -> ControlState {
        self.control
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn completion_epoch(&self) -> u64 {
        self.completion_epoch
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            control_state: self.control,
            concurrency_limit: self.concurrency_limit,
            retry_waiting: self.retries.waiting_count(),
            ..Progress::default()
        };

        for id in self.graph.unit_ids() {
            match self.unit_status(id) {
                Some(UnitStatus::Pending) => progress.pending += 1,
                Some(UnitStatus::Queued) => progress.queued += 1,
                Some(UnitStatus::Running) => progress.running += 1,
                Some(UnitStatus::Completed) => progress.completed += 1,
                Some(UnitStatus::Failed) => progress.failed += 1,
                None => {}
            }
        }
        progress
    }

    pub fn failed(&self) -> Vec<UnitId> {
        self.failed.iter().cloned().collect()
    }

    pub fn active(&self) -> Vec<(UnitId, ExecutionId)> {
        self.active
            .iter()
            .map(|(unit, a)| (unit.clone(), a.execution_id.clone()))
            .collect()
    }

    pub fn completed(&self) -> Vec<UnitId> {
        self.completed
            .iter()
            .filter(|id| !self.external_completed.contains(*id))
            .cloned()
            .collect()
    }

    /// Status of a unit known to the orchestrator. Externally completed
    /// dependencies report `Completed` too. A queued unit still waiting on
    /// a dependency is `Pending`; it only becomes `Queued` once it is ready.
    pub fn unit_status(&self, id: &str) -> Option<UnitStatus> {
        if self.completed.contains(id) {
            return Some(UnitStatus::Completed);
        }
        if !self.graph.contains(id) {
            return None;
        }
        Some(if self.failed.contains(id) {
            UnitStatus::Failed
        } else if self.active.contains_key(id) {
            UnitStatus::Running
        } else if self.queue.contains(id) && self.dependencies_satisfied(id) {
            UnitStatus::Queued
        } else {
            UnitStatus::Pending
        })
    }

    pub fn known_units(&self) -> usize {
        self.graph.len()
    }

    /// Final outcome for the report aggregator. Units neither completed nor
    /// failed are reported as blocked.
    pub fn outcome(&self) -> SuiteOutcome {
        SuiteOutcome {
            completed: self.completed(),
            failed: self.failed(),
            blocked: self
                .graph
                .unit_ids()
                .filter(|id| !self.is_terminal(id))
                .map(str::to_string)
                .collect(),
        }
    }
}
