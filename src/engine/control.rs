// src/engine/control.rs

//! Clonable handle for operating a running orchestrator.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::dag::UnitSpec;
use crate::engine::{ControlCommand, IntakeSource, RuntimeEvent, StatusQuery};
use crate::types::{ControlState, ExecutionId, UnitId, UnitStatus};

/// Unit counts per status plus controller state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// Units waiting out a retry or requeue delay (also counted as pending).
    pub retry_waiting: usize,
    pub control_state: ControlState,
    pub concurrency_limit: usize,
}

impl Progress {
    pub fn total(&self) -> usize {
        self.pending + self.queued + self.running + self.completed + self.failed
    }
}

/// Sends control operations and queries into the runtime mailbox.
///
/// Every method fails only if the runtime has already stopped.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<RuntimeEvent>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self { tx }
    }

    pub async fn enqueue(&self, units: Vec<UnitSpec>) -> Result<()> {
        self.send(RuntimeEvent::UnitsArrived {
            units,
            source: IntakeSource::Manual,
        })
        .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.control(ControlCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.control(ControlCommand::Resume).await
    }

    pub async fn drain(&self) -> Result<()> {
        self.control(ControlCommand::Drain).await
    }

    pub async fn emergency_stop(&self) -> Result<()> {
        self.control(ControlCommand::EmergencyStop).await
    }

    pub async fn adjust_concurrency(&self, limit: usize) -> Result<()> {
        self.control(ControlCommand::AdjustConcurrency(limit)).await
    }

    pub async fn progress(&self) -> Result<Progress> {
        let (tx, rx) = oneshot::channel();
        self.query(StatusQuery::Progress(tx), rx).await
    }

    pub async fn failed(&self) -> Result<Vec<UnitId>> {
        let (tx, rx) = oneshot::channel();
        self.query(StatusQuery::Failed(tx), rx).await
    }

    pub async fn active(&self) -> Result<Vec<(UnitId, ExecutionId)>> {
        let (tx, rx) = oneshot::channel();
        self.query(StatusQuery::Active(tx), rx).await
    }

    pub async fn unit_status(&self, unit: impl Into<UnitId>) -> Result<Option<UnitStatus>> {
        let (tx, rx) = oneshot::channel();
        self.query(StatusQuery::UnitStatus(unit.into(), tx), rx)
            .await
    }

    async fn control(&self, command: ControlCommand) -> Result<()> {
        self.send(RuntimeEvent::Control(command)).await
    }

    async fn query<T>(&self, query: StatusQuery, rx: oneshot::Receiver<T>) -> Result<T> {
        self.send(RuntimeEvent::Query(query)).await?;
        rx.await.map_err(|_| anyhow!("runtime stopped before answering"))
    }

    async fn send(&self, event: RuntimeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("runtime is not running"))
    }
}
