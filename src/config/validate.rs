// src/config/validate.rs

use regex::Regex;

use crate::config::model::{parse_duration, ConfigFile, RawConfigFile, Timings};
use crate::dag::{DependencyGraph, UnitSpec};
use crate::errors::{BuilddagError, Result};
use crate::types::{FailureCategory, RegistryKind};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = BuilddagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let timings = validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw, timings))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<Timings> {
    ensure_has_units(cfg)?;
    validate_limits(cfg)?;
    let timings = parse_timings(cfg)?;
    validate_registry(cfg)?;
    validate_categories(cfg)?;
    validate_unit_dependencies(cfg)?;
    validate_graph(cfg)?;
    Ok(timings)
}

fn ensure_has_units(cfg: &RawConfigFile) -> Result<()> {
    // A file registry supplies its own units.
    if cfg.unit.is_empty() && cfg.registry.kind == RegistryKind::Manifest {
        return Err(BuilddagError::ConfigError(
            "config must contain at least one [unit.<id>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_limits(cfg: &RawConfigFile) -> Result<()> {
    if cfg.orchestrator.concurrency == 0 {
        return Err(BuilddagError::ConfigError(
            "[orchestrator].concurrency must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.orchestrator.max_retries == 0 {
        return Err(BuilddagError::ConfigError(
            "[orchestrator].max_retries must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.orchestrator.checkpoint_every == 0 {
        return Err(BuilddagError::ConfigError(
            "[orchestrator].checkpoint_every must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.remediation.max_attempts == 0 {
        return Err(BuilddagError::ConfigError(
            "[remediation].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn parse_timings(cfg: &RawConfigFile) -> Result<Timings> {
    let field = |name: &str, value: &str| {
        parse_duration(value).map_err(|e| BuilddagError::ConfigError(format!("{name}: {e}")))
    };

    let stage_timeout = match cfg.stages.timeout.as_deref() {
        Some(t) => Some(field("[stages].timeout", t)?),
        None => None,
    };

    let timings = Timings {
        backoff_base: field("[orchestrator].backoff_base", &cfg.orchestrator.backoff_base)?,
        backoff_max: field("[orchestrator].backoff_max", &cfg.orchestrator.backoff_max)?,
        requeue_delay: field("[orchestrator].requeue_delay", &cfg.orchestrator.requeue_delay)?,
        checkpoint_interval: field(
            "[orchestrator].checkpoint_interval",
            &cfg.orchestrator.checkpoint_interval,
        )?,
        poll_interval: field("[registry].poll_interval", &cfg.registry.poll_interval)?,
        registry_timeout: field("[registry].timeout", &cfg.registry.timeout)?,
        stage_timeout,
    };

    if timings.backoff_base > timings.backoff_max {
        return Err(BuilddagError::ConfigError(format!(
            "[orchestrator].backoff_base ({}) exceeds backoff_max ({})",
            cfg.orchestrator.backoff_base, cfg.orchestrator.backoff_max
        )));
    }

    Ok(timings)
}

fn validate_registry(cfg: &RawConfigFile) -> Result<()> {
    if cfg.registry.kind == RegistryKind::File && cfg.registry.path.is_none() {
        return Err(BuilddagError::ConfigError(
            "[registry].path is required when kind = \"file\"".to_string(),
        ));
    }
    Ok(())
}

fn validate_categories(cfg: &RawConfigFile) -> Result<()> {
    for (name, pattern) in cfg.stages.categories.iter() {
        name.parse::<FailureCategory>()
            .map_err(|e| BuilddagError::ConfigError(format!("[stages.categories]: {e}")))?;
        Regex::new(pattern).map_err(|e| {
            BuilddagError::ConfigError(format!(
                "[stages.categories].{name}: invalid regex '{pattern}': {e}"
            ))
        })?;
    }
    Ok(())
}

fn validate_unit_dependencies(cfg: &RawConfigFile) -> Result<()> {
    // Dependencies outside the manifest are only meaningful when an external
    // registry can vouch for them.
    if cfg.registry.kind == RegistryKind::File {
        return Ok(());
    }

    for (id, unit) in cfg.unit.iter() {
        for dep in unit.after.iter() {
            if !cfg.unit.contains_key(dep) && dep != id {
                return Err(BuilddagError::ConfigError(format!(
                    "unit '{}' has unknown dependency '{}' in `after`",
                    id, dep
                )));
            }
        }
    }
    Ok(())
}

fn validate_graph(cfg: &RawConfigFile) -> Result<()> {
    let specs = cfg
        .unit
        .iter()
        .map(|(id, unit)| UnitSpec::from_config(id, unit))
        .collect();
    DependencyGraph::build(specs)?;
    Ok(())
}
