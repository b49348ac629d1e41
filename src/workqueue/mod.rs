// src/workqueue/mod.rs

//! External work queue (registry) abstraction.
//!
//! The registry is the outside world's view of which units exist, which are
//! eligible to build, and what state each one is in. The orchestrator pulls
//! eligible units from it and pushes status changes back, but never depends
//! on it being available: every failure surfaces as a [`RegistryError`] that
//! the runtime logs before carrying on with its internal queue.
//!
//! - [`manifest`] keeps statuses in memory, seeded from the config manifest.
//! - [`file`] reads and rewrites a JSON document shared with other tools.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::UnitSpec;
use crate::types::{UnitId, UnitStatus};

pub mod file;
pub mod manifest;

pub use file::FileRegistry;
pub use manifest::ManifestRegistry;

/// Boxed future returned by the registry trait.
pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RegistryError>> + Send + 'a>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed registry data: {0}")]
    Malformed(String),
}

/// A unit as the registry describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub id: UnitId,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<UnitId>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub plan: Option<String>,
}

impl UnitRef {
    pub fn into_spec(self) -> UnitSpec {
        let path = self.path.unwrap_or_else(|| PathBuf::from(&self.id));
        let mut spec = UnitSpec::new(self.id).with_dependencies(self.dependencies);
        spec.category = self.category;
        spec.priority = self.priority;
        spec.path = path;
        spec.plan = self.plan;
        spec
    }
}

impl From<&UnitSpec> for UnitRef {
    fn from(spec: &UnitSpec) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            dependencies: spec.dependencies.clone(),
            category: spec.category.clone(),
            path: Some(spec.path.clone()),
            plan: spec.plan.clone(),
        }
    }
}

/// Client for the external work queue.
pub trait WorkQueueClient: Send + Sync {
    /// Units the registry currently considers eligible: not terminal, with
    /// every dependency completed. Sorted by descending priority, then id.
    fn fetch_ready(&self) -> RegistryFuture<'_, Vec<UnitRef>>;

    /// Record a status change for a unit.
    fn report_status(
        &self,
        unit: UnitId,
        status: UnitStatus,
        detail: Option<String>,
    ) -> RegistryFuture<'_, ()>;

    /// Return the subset of `deps` that the registry does NOT consider
    /// completed.
    fn incomplete_dependencies(&self, deps: Vec<UnitId>) -> RegistryFuture<'_, Vec<UnitId>>;
}

/// Run a registry call under `limit`; expiry becomes [`RegistryError::Timeout`].
pub async fn bounded<T>(limit: Duration, call: RegistryFuture<'_, T>) -> Result<T, RegistryError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(RegistryError::Timeout(limit)))
}

/// Registry entry shared by both implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub unit: UnitRef,
    #[serde(default = "default_status")]
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

fn default_status() -> UnitStatus {
    UnitStatus::Pending
}

/// Eligible entries, sorted for `fetch_ready`.
pub(crate) fn ready_entries(entries: &[RegistryEntry]) -> Vec<UnitRef> {
    let completed = completed_ids(entries);

    let mut ready: Vec<UnitRef> = entries
        .iter()
        .filter(|e| !e.status.is_terminal())
        .filter(|e| e.unit.dependencies.iter().all(|d| completed.contains(d.as_str())))
        .map(|e| e.unit.clone())
        .collect();

    ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    ready
}

/// Dependencies among `deps` that are not completed in `entries`.
pub(crate) fn incomplete_among(entries: &[RegistryEntry], deps: &[UnitId]) -> Vec<UnitId> {
    let completed = completed_ids(entries);
    deps.iter()
        .filter(|d| !completed.contains(d.as_str()))
        .cloned()
        .collect()
}

fn completed_ids(entries: &[RegistryEntry]) -> HashSet<&str> {
    entries
        .iter()
        .filter(|e| e.status == UnitStatus::Completed)
        .map(|e| e.unit.id.as_str())
        .collect()
}
