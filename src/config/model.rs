// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{BackoffPolicy, RegistryKind};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [orchestrator]
/// concurrency = 2
///
/// [stages]
/// build = "cargo build"
///
/// [unit.core]
/// path = "crates/core"
///
/// [unit.cli]
/// path = "crates/cli"
/// after = ["core"]
/// ```
///
/// All sections except `[unit.<id>]` are optional and have defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub stages: StagesSection,

    #[serde(default)]
    pub remediation: RemediationSection,

    #[serde(default)]
    pub suite: SuiteSection,

    /// All units from `[unit.<id>]`, keyed by unit id.
    #[serde(default)]
    pub unit: BTreeMap<String, UnitConfig>,
}

/// Validated configuration.
///
/// Only constructible through `TryFrom<RawConfigFile>` (see `validate.rs`), so
/// holders can rely on durations parsing and the unit graph being acyclic.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub orchestrator: OrchestratorSection,
    pub registry: RegistrySection,
    pub stages: StagesSection,
    pub remediation: RemediationSection,
    pub suite: SuiteSection,
    pub unit: BTreeMap<String, UnitConfig>,
    /// Duration strings from the sections above, parsed once.
    pub timings: Timings,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile, timings: Timings) -> Self {
        Self {
            orchestrator: raw.orchestrator,
            registry: raw.registry,
            stages: raw.stages,
            remediation: raw.remediation,
            suite: raw.suite,
            unit: raw.unit,
            timings,
        }
    }
}

/// Parsed durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub requeue_delay: Duration,
    pub checkpoint_interval: Duration,
    pub poll_interval: Duration,
    pub registry_timeout: Duration,
    pub stage_timeout: Option<Duration>,
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// Maximum number of pipelines running at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts allowed for retryable failures before a unit is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    /// Delay before re-queuing a unit whose dependencies the registry did not
    /// confirm at pipeline start.
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay: String,

    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,

    /// Checkpoint after this many terminal results.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u32,

    /// ... or after this much wall time, whichever comes first.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: String,

    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> String {
    "2s".to_string()
}

fn default_backoff_max() -> String {
    "5m".to_string()
}

fn default_requeue_delay() -> String {
    "1s".to_string()
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".builddag/checkpoint.json")
}

fn default_checkpoint_every() -> u32 {
    10
}

fn default_checkpoint_interval() -> String {
    "60s".to_string()
}

fn default_report_dir() -> PathBuf {
    PathBuf::from(".builddag/reports")
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            backoff: BackoffPolicy::default(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            requeue_delay: default_requeue_delay(),
            checkpoint_path: default_checkpoint_path(),
            checkpoint_every: default_checkpoint_every(),
            checkpoint_interval: default_checkpoint_interval(),
            report_dir: default_report_dir(),
        }
    }
}

/// `[registry]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default)]
    pub kind: RegistryKind,

    /// JSON document for `kind = "file"`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default = "default_registry_timeout")]
    pub timeout: String,
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_registry_timeout() -> String {
    "10s".to_string()
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            kind: RegistryKind::default(),
            path: None,
            poll_interval: default_poll_interval(),
            timeout: default_registry_timeout(),
        }
    }
}

/// `[stages]` section: default shell commands for each pipeline stage.
///
/// A stage without a command is treated as passing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagesSection {
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub publish: Option<String>,

    /// Per-stage timeout; a stage exceeding it fails.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Extra regexes that classify quality output lines, keyed by category
    /// name (`lint`, `type_check`, `coverage`, `format`).
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
}

/// `[remediation]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RemediationSection {
    /// Oracle command. Receives the request as JSON on stdin and must print a
    /// JSON response on stdout. Without it, quality failures are terminal.
    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Directory of tuned prompts named after the category set,
    /// e.g. `lint+type_check.md`.
    #[serde(default)]
    pub prompt_dir: Option<PathBuf>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RemediationSection {
    fn default() -> Self {
        Self {
            cmd: None,
            max_attempts: default_max_attempts(),
            prompt_dir: None,
        }
    }
}

/// `[suite]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteSection {
    /// Run once after every unit completed; suppressed if any unit failed.
    #[serde(default)]
    pub publish_cmd: Option<String>,
}

/// `[unit.<id>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnitConfig {
    /// Workspace path for the stage commands. Defaults to the unit id.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Ordering hint only.
    #[serde(default)]
    pub category: Option<String>,

    /// Units that must complete before this one starts.
    #[serde(default)]
    pub after: Vec<String>,

    /// Plan reference passed to the remediation oracle.
    #[serde(default)]
    pub plan: Option<String>,

    #[serde(default)]
    pub priority: i64,

    // Per-unit stage command overrides.
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub publish: Option<String>,
}

/// Parse a duration string such as `"500ms"`, `"3s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' missing unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
