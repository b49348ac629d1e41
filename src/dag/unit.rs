// src/dag/unit.rs

//! Static description of a buildable unit.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::model::UnitConfig;
use crate::types::UnitId;

/// A buildable unit as known to the graph and the orchestrator.
///
/// Serializable because checkpoints carry every known unit, including those
/// that arrived from the registry rather than the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub id: UnitId,
    #[serde(default)]
    pub category: Option<String>,
    /// Sorted and deduplicated.
    #[serde(default)]
    pub dependencies: Vec<UnitId>,
    #[serde(default)]
    pub priority: i64,
    pub path: PathBuf,
    #[serde(default)]
    pub plan: Option<String>,
}

impl UnitSpec {
    /// A unit with no dependencies whose workspace path is its id.
    pub fn new(id: impl Into<UnitId>) -> Self {
        let id = id.into();
        Self {
            path: PathBuf::from(&id),
            id,
            category: None,
            dependencies: Vec::new(),
            priority: 0,
            plan: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UnitId>,
    {
        self.dependencies = normalize_deps(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_config(id: &str, cfg: &UnitConfig) -> Self {
        Self {
            id: id.to_string(),
            category: cfg.category.clone(),
            dependencies: normalize_deps(cfg.after.clone()),
            priority: cfg.priority,
            path: cfg.path.clone().unwrap_or_else(|| PathBuf::from(id)),
            plan: cfg.plan.clone(),
        }
    }
}

fn normalize_deps(mut deps: Vec<UnitId>) -> Vec<UnitId> {
    deps.sort();
    deps.dedup();
    deps
}
