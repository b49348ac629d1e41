// src/config/mod.rs

//! Configuration loading and validation for builddag.
//!
//! - `model.rs`: the TOML-backed data model.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: semantic checks (durations, limits, unit graph).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    parse_duration, ConfigFile, OrchestratorSection, RawConfigFile, RegistrySection,
    RemediationSection, StagesSection, SuiteSection, Timings, UnitConfig,
};
