// tests/config.rs
mod common;
use crate::common::{init_tracing, ConfigFileBuilder, TestResult, UnitConfigBuilder};

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use builddag::cli::{CliArgs, LogLevel};
use builddag::config::{load_and_validate, parse_duration, ConfigFile};
use builddag::dag::UnitSpec;
use builddag::engine::{RuntimeOptions, RuntimeSettings};
use builddag::errors::BuilddagError;
use builddag::exec::{PipelineSettings, ShellStageRunner};
use builddag::logging::resolve_level;
use builddag::types::{BackoffPolicy, ControlState, RegistryKind, Stage};
use clap::Parser;
use tempfile::NamedTempFile;
use tracing::Level;

const FULL_CONFIG: &str = r#"
[orchestrator]
concurrency = 3
max_retries = 5
backoff = "fibonacci"
backoff_base = "500ms"
backoff_max = "1m"
checkpoint_every = 4
checkpoint_interval = "30s"
checkpoint_path = "state/cp.json"

[registry]
poll_interval = "2s"

[stages]
build = "cargo build -p {unit}"
test = "cargo test -p {unit}"
quality = "cargo clippy -p {unit}"
timeout = "10m"

[stages.categories]
lint = "^warning: unused"

[remediation]
cmd = "fixer --json"
max_attempts = 2

[suite]
publish_cmd = "release-all"

[unit.core]
path = "crates/core"
category = "library"

[unit.cli]
path = "crates/cli"
after = ["core"]
plan = "docs/plan.md"
priority = 7
quality = "true"
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

fn config_error(result: Result<ConfigFile, BuilddagError>) -> String {
    match result {
        Err(BuilddagError::ConfigError(msg)) => msg,
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn full_config_is_loaded_and_validated() -> TestResult {
    init_tracing();
    let file = write_config(FULL_CONFIG);
    let cfg = load_and_validate(file.path())?;

    assert_eq!(cfg.orchestrator.concurrency, 3);
    assert_eq!(cfg.orchestrator.backoff, BackoffPolicy::Fibonacci);
    assert_eq!(cfg.orchestrator.checkpoint_path, PathBuf::from("state/cp.json"));
    assert_eq!(cfg.registry.kind, RegistryKind::Manifest);
    assert_eq!(cfg.timings.backoff_base, Duration::from_millis(500));
    assert_eq!(cfg.timings.backoff_max, Duration::from_secs(60));
    assert_eq!(cfg.timings.poll_interval, Duration::from_secs(2));
    assert_eq!(cfg.timings.registry_timeout, Duration::from_secs(10));
    assert_eq!(cfg.timings.stage_timeout, Some(Duration::from_secs(600)));
    assert_eq!(cfg.suite.publish_cmd.as_deref(), Some("release-all"));

    let cli = UnitSpec::from_config("cli", &cfg.unit["cli"]);
    assert_eq!(cli.dependencies, vec!["core"]);
    assert_eq!(cli.path, PathBuf::from("crates/cli"));
    assert_eq!(cli.priority, 7);
    assert_eq!(cli.plan.as_deref(), Some("docs/plan.md"));

    let options = RuntimeOptions::from_config(&cfg, true);
    assert!(options.exit_when_idle);
    assert_eq!(options.max_retries, 5);
    assert_eq!(options.checkpoint_every, 4);
    assert_eq!(options.backoff.delay(3), Duration::from_millis(1500));

    let settings = RuntimeSettings::from_config(&cfg);
    assert_eq!(settings.checkpoint_interval, Duration::from_secs(30));

    let pipeline = PipelineSettings::from_config(&cfg, "/work");
    assert_eq!(pipeline.max_remediation_attempts, 2);
    assert_eq!(pipeline.stage_timeout, Some(Duration::from_secs(600)));
    Ok(())
}

#[test]
fn unit_commands_override_stage_defaults() -> TestResult {
    let file = write_config(FULL_CONFIG);
    let cfg = load_and_validate(file.path())?;
    let runner = ShellStageRunner::from_config(&cfg, "/work");

    let core = UnitSpec::from_config("core", &cfg.unit["core"]);
    let cli = UnitSpec::from_config("cli", &cfg.unit["cli"]);

    assert_eq!(
        runner.command_for(&core, Stage::Building).as_deref(),
        Some("cargo build -p core")
    );
    assert_eq!(runner.command_for(&cli, Stage::QualityChecking).as_deref(), Some("true"));
    assert_eq!(
        runner.command_for(&cli, Stage::Testing).as_deref(),
        Some("cargo test -p cli")
    );
    // No publish command anywhere: the stage is skipped.
    assert_eq!(runner.command_for(&cli, Stage::Publishing), None);
    Ok(())
}

#[test]
fn minimal_config_uses_defaults() -> TestResult {
    let file = write_config("[unit.only]\n");
    let cfg = load_and_validate(file.path())?;

    assert_eq!(cfg.orchestrator.concurrency, 4);
    assert_eq!(cfg.orchestrator.max_retries, 3);
    assert_eq!(cfg.orchestrator.checkpoint_every, 10);
    assert_eq!(cfg.remediation.max_attempts, 3);
    assert_eq!(cfg.timings.backoff_base, Duration::from_secs(2));
    assert_eq!(cfg.timings.backoff_max, Duration::from_secs(300));
    assert_eq!(cfg.timings.checkpoint_interval, Duration::from_secs(60));
    assert_eq!(cfg.timings.stage_timeout, None);
    assert!(cfg.remediation.cmd.is_none());
    assert_eq!(cfg.orchestrator.backoff, BackoffPolicy::Exponential);
    assert_eq!(cfg.registry.kind, RegistryKind::Manifest);
    assert_eq!(ControlState::default(), ControlState::Running);
    Ok(())
}

#[test]
fn unreadable_or_malformed_files_are_reported() {
    let missing = load_and_validate("/definitely/not/here/Builddag.toml");
    assert!(matches!(missing, Err(BuilddagError::IoError(_))));

    let file = write_config("[orchestrator\nconcurrency = 2");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(BuilddagError::TomlError(_))
    ));

    let file = write_config("[orchestrator]\nbackoff = \"linear\"\n[unit.a]\n");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(BuilddagError::TomlError(_))
    ));
}

#[test]
fn validation_rejects_bad_limits_and_durations() {
    let one_unit = || ConfigFileBuilder::new().with_unit("a", UnitConfigBuilder::new().build());

    let msg = config_error(ConfigFile::try_from(one_unit().concurrency(0).raw()));
    assert!(msg.contains("concurrency"), "{msg}");

    let msg = config_error(ConfigFile::try_from(one_unit().max_retries(0).raw()));
    assert!(msg.contains("max_retries"), "{msg}");

    let msg = config_error(ConfigFile::try_from(
        one_unit()
            .backoff(BackoffPolicy::Exponential, "10", "1m")
            .raw(),
    ));
    assert!(msg.contains("backoff_base"), "{msg}");

    let msg = config_error(ConfigFile::try_from(
        one_unit()
            .backoff(BackoffPolicy::Exponential, "2m", "1m")
            .raw(),
    ));
    assert!(msg.contains("exceeds"), "{msg}");

    let msg = config_error(ConfigFile::try_from(one_unit().stage_timeout("5 days").raw()));
    assert!(msg.contains("[stages].timeout"), "{msg}");
}

#[test]
fn validation_rejects_bad_units_and_rules() {
    let msg = config_error(ConfigFile::try_from(ConfigFileBuilder::new().raw()));
    assert!(msg.contains("at least one"), "{msg}");

    let msg = config_error(ConfigFile::try_from(
        ConfigFileBuilder::new()
            .with_unit("app", UnitConfigBuilder::new().after("ghost").build())
            .raw(),
    ));
    assert!(msg.contains("ghost"), "{msg}");

    let cycle = ConfigFile::try_from(
        ConfigFileBuilder::new()
            .with_unit("a", UnitConfigBuilder::new().after("b").build())
            .with_unit("b", UnitConfigBuilder::new().after("a").build())
            .raw(),
    );
    assert!(matches!(cycle, Err(BuilddagError::CycleDetected { .. })));

    let one_unit = || ConfigFileBuilder::new().with_unit("a", UnitConfigBuilder::new().build());

    let msg = config_error(ConfigFile::try_from(one_unit().category_rule("style", "x").raw()));
    assert!(msg.contains("unknown failure category"), "{msg}");

    let msg = config_error(ConfigFile::try_from(one_unit().category_rule("lint", "([").raw()));
    assert!(msg.contains("invalid regex"), "{msg}");

    let mut raw = one_unit().raw();
    raw.registry.kind = RegistryKind::File;
    let msg = config_error(ConfigFile::try_from(raw));
    assert!(msg.contains("[registry].path"), "{msg}");
}

#[test]
fn file_registry_allows_external_dependencies_and_no_manifest() {
    let cfg = ConfigFileBuilder::new()
        .file_registry("queue.json")
        .with_unit("app", UnitConfigBuilder::new().after("vendored-lib").build())
        .build();
    assert_eq!(cfg.registry.kind, RegistryKind::File);

    let cfg = ConfigFileBuilder::new().file_registry("queue.json").build();
    assert!(cfg.unit.is_empty());
}

#[test]
fn duration_strings() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
    assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
    assert_eq!(parse_duration("1H"), Ok(Duration::from_secs(3600)));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("ms").is_err());
    assert!(parse_duration("3d").is_err());
}

#[test]
fn cli_flags() {
    let args = CliArgs::parse_from([
        "builddag",
        "--config",
        "ci/Builddag.toml",
        "--once",
        "--fresh",
        "--concurrency",
        "6",
        "--log-level",
        "debug",
    ]);
    assert_eq!(args.config, "ci/Builddag.toml");
    assert!(args.once);
    assert!(args.fresh);
    assert_eq!(args.concurrency, Some(6));
    assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    assert!(!args.dry_run);

    let defaults = CliArgs::parse_from(["builddag"]);
    assert_eq!(defaults.config, "Builddag.toml");
    assert!(!defaults.once);
    assert_eq!(defaults.concurrency, None);

    assert!(CliArgs::try_parse_from(["builddag", "--log-level", "loud"]).is_err());
    assert!(CliArgs::try_parse_from(["builddag", "--concurrency", "many"]).is_err());
}

#[test]
fn log_level_resolution() {
    assert_eq!(resolve_level(Some(LogLevel::Trace), Some("error")), Level::TRACE);
    assert_eq!(resolve_level(None, Some("debug")), Level::DEBUG);
    assert_eq!(resolve_level(None, Some(" WARNING ")), Level::WARN);
    assert_eq!(resolve_level(None, Some("chatty")), Level::INFO);
    assert_eq!(resolve_level(None, None), Level::INFO);
}
