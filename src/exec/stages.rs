// src/exec/stages.rs

//! Stage operations: build, test, quality and publish.
//!
//! The pipeline only sees the [`StageRunner`] trait. [`ShellStageRunner`] is
//! the production implementation and runs configured shell commands; tests
//! provide scripted runners instead.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ConfigFile;
use crate::dag::UnitSpec;
use crate::types::{FailureCategory, Stage, UnitId};

/// Boxed future returned by [`StageRunner::run`].
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<StageResult>> + Send + 'a>>;

/// A failure the runner already classified, e.g. from a machine-readable
/// quality tool report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredFailure {
    pub category: FailureCategory,
    pub message: String,
}

/// Outcome of one stage invocation.
///
/// An `Err` from the runner means the stage could not be run at all
/// (infrastructure); `success == false` means it ran and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub success: bool,
    pub duration: Duration,
    pub output: String,
    pub failures: Vec<StructuredFailure>,
}

impl StageResult {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            success: true,
            duration: Duration::ZERO,
            output: output.into(),
            failures: Vec::new(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            duration: Duration::ZERO,
            output: output.into(),
            failures: Vec::new(),
        }
    }

    pub fn with_failures(mut self, failures: Vec<StructuredFailure>) -> Self {
        self.failures = failures;
        self
    }

    /// Last `n` lines of output, for failure records.
    pub fn output_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Runs one stage of one unit.
///
/// Only `Building`, `Testing`, `QualityChecking` and `Publishing` are ever
/// requested.
pub trait StageRunner: Send + Sync {
    fn run<'a>(&'a self, unit: &'a UnitSpec, stage: Stage) -> StageFuture<'a>;
}

/// Shell commands for the four runnable stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCommands {
    pub build: Option<String>,
    pub test: Option<String>,
    pub quality: Option<String>,
    pub publish: Option<String>,
}

impl StageCommands {
    pub fn get(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Building => self.build.as_deref(),
            Stage::Testing => self.test.as_deref(),
            Stage::QualityChecking => self.quality.as_deref(),
            Stage::Publishing => self.publish.as_deref(),
            Stage::VerifyingDeps | Stage::Remediating => None,
        }
    }

    /// `other`'s commands win where set.
    fn overlay(&self, other: &StageCommands) -> StageCommands {
        StageCommands {
            build: other.build.clone().or_else(|| self.build.clone()),
            test: other.test.clone().or_else(|| self.test.clone()),
            quality: other.quality.clone().or_else(|| self.quality.clone()),
            publish: other.publish.clone().or_else(|| self.publish.clone()),
        }
    }
}

/// Runs stage commands through the platform shell in the unit's directory.
///
/// `{unit}`, `{path}` and `{category}` in a command are substituted before it
/// runs. A stage with no configured command passes without spawning anything.
#[derive(Debug, Clone)]
pub struct ShellStageRunner {
    defaults: StageCommands,
    overrides: HashMap<UnitId, StageCommands>,
    base_dir: PathBuf,
}

impl ShellStageRunner {
    pub fn new(defaults: StageCommands, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            base_dir: base_dir.into(),
        }
    }

    /// Default commands from `[stages]`, per-unit overrides from `[unit.<id>]`.
    /// Relative unit paths resolve against `base_dir`.
    pub fn from_config(cfg: &ConfigFile, base_dir: impl Into<PathBuf>) -> Self {
        let defaults = StageCommands {
            build: cfg.stages.build.clone(),
            test: cfg.stages.test.clone(),
            quality: cfg.stages.quality.clone(),
            publish: cfg.stages.publish.clone(),
        };

        let overrides = cfg
            .unit
            .iter()
            .map(|(id, unit)| {
                (
                    id.clone(),
                    StageCommands {
                        build: unit.build.clone(),
                        test: unit.test.clone(),
                        quality: unit.quality.clone(),
                        publish: unit.publish.clone(),
                    },
                )
            })
            .collect();

        Self {
            defaults,
            overrides,
            base_dir: base_dir.into(),
        }
    }

    pub fn with_override(mut self, unit: impl Into<UnitId>, commands: StageCommands) -> Self {
        self.overrides.insert(unit.into(), commands);
        self
    }

    /// Effective command for `stage` of `unit`, after substitution.
    pub fn command_for(&self, unit: &UnitSpec, stage: Stage) -> Option<String> {
        let commands = match self.overrides.get(&unit.id) {
            Some(o) => self.defaults.overlay(o),
            None => self.defaults.clone(),
        };
        commands
            .get(stage)
            .map(|template| substitute(template, unit, &self.unit_dir(unit)))
    }

    fn unit_dir(&self, unit: &UnitSpec) -> PathBuf {
        self.base_dir.join(&unit.path)
    }
}

impl StageRunner for ShellStageRunner {
    fn run<'a>(&'a self, unit: &'a UnitSpec, stage: Stage) -> StageFuture<'a> {
        Box::pin(async move {
            let Some(cmd) = self.command_for(unit, stage) else {
                debug!(unit = %unit.id, %stage, "no command configured; stage passes");
                return Ok(StageResult::passed(""));
            };
            run_shell(&unit.id, stage, &cmd, &self.unit_dir(unit)).await
        })
    }
}

/// Run `cmd` through `sh -c` (or `cmd /C`) in `dir`, capturing both streams.
///
/// The child is killed if the returned future is dropped, which is how stage
/// timeouts and cancellation stop a running command.
pub async fn run_shell(unit: &str, stage: Stage, cmd: &str, dir: &Path) -> Result<StageResult> {
    info!(unit = %unit, %stage, cmd = %cmd, dir = %dir.display(), "starting stage process");

    let mut command = shell_command(cmd);
    command
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let output = command
        .output()
        .await
        .with_context(|| format!("spawning {stage} process for unit '{unit}' in {}", dir.display()))?;
    let duration = started.elapsed();

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }

    let code = output.status.code().unwrap_or(-1);
    info!(
        unit = %unit,
        %stage,
        exit_code = code,
        success = output.status.success(),
        duration_ms = duration.as_millis() as u64,
        "stage process exited"
    );

    Ok(StageResult {
        success: output.status.success(),
        duration,
        output: text,
        failures: Vec::new(),
    })
}

/// Build a shell command appropriate for the platform.
pub(crate) fn shell_command(cmd: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    }
}

fn substitute(template: &str, unit: &UnitSpec, dir: &Path) -> String {
    template
        .replace("{unit}", &unit.id)
        .replace("{path}", &dir.to_string_lossy())
        .replace("{category}", unit.category.as_deref().unwrap_or(""))
}
