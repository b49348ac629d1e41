// src/dag/mod.rs

//! Unit dependency graph.
//!
//! - [`unit`] holds the static description of a unit.
//! - [`graph`] builds the DAG, detects cycles and assigns informational
//!   layers.

pub mod graph;
pub mod unit;

pub use graph::DependencyGraph;
pub use unit::UnitSpec;
