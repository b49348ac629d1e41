// src/engine/checkpoint.rs

//! Durable orchestrator snapshots.
//!
//! A snapshot holds everything the core needs to resume after a restart
//! except live handles: running pipelines are recorded by unit and execution
//! id only, and are re-queued on restore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dag::UnitSpec;
use crate::errors::{BuilddagError, Result};
use crate::fs::FileSystem;
use crate::engine::retry::RetryState;
use crate::types::{ControlState, ExecutionId, UnitId};

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub unit: UnitId,
    pub execution_id: ExecutionId,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub unit: UnitId,
    #[serde(flatten)]
    pub state: RetryState,
}

/// Serializable orchestrator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Every unit the orchestrator knows about.
    pub units: Vec<UnitSpec>,
    /// Internal queue in arrival order.
    pub queue: Vec<UnitId>,
    pub in_flight: Vec<InFlight>,
    #[serde(default)]
    pub retries: Vec<RetryEntry>,
    pub completed: Vec<UnitId>,
    /// Subset of `completed` vouched for by the registry rather than built here.
    #[serde(default)]
    pub external_completed: Vec<UnitId>,
    pub failed: Vec<UnitId>,
    pub concurrency_limit: usize,
    pub control_state: ControlState,
}

/// Reads and writes the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            path: path.into(),
            fs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, if one exists.
    pub fn load(&self) -> Result<Option<OrchestratorSnapshot>> {
        if !self.fs.exists(&self.path) {
            debug!(path = %self.path.display(), "no checkpoint found");
            return Ok(None);
        }

        let text = self.fs.read_to_string(&self.path)?;
        let snapshot: OrchestratorSnapshot = serde_json::from_str(&text).map_err(|e| {
            BuilddagError::Checkpoint(format!("{}: {e}", self.path.display()))
        })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(BuilddagError::Checkpoint(format!(
                "{}: unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                self.path.display(),
                snapshot.version
            )));
        }

        info!(
            path = %self.path.display(),
            saved_at = %snapshot.saved_at,
            completed = snapshot.completed.len(),
            queued = snapshot.queue.len(),
            in_flight = snapshot.in_flight.len(),
            "loaded checkpoint"
        );
        Ok(Some(snapshot))
    }

    /// Write atomically; a crash mid-write leaves the previous checkpoint.
    pub fn save(&self, snapshot: &OrchestratorSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        self.fs.write(&self.path, &bytes)?;
        debug!(path = %self.path.display(), "checkpoint written");
        Ok(())
    }

    pub fn discard(&self) -> Result<()> {
        self.fs.remove_file(&self.path)?;
        info!(path = %self.path.display(), "checkpoint discarded");
        Ok(())
    }
}
