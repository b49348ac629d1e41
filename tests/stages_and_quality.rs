// tests/stages_and_quality.rs
mod common;
use crate::common::{init_tracing, with_timeout, TestResult};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use builddag::dag::UnitSpec;
use builddag::exec::{
    CancelFlag, MetricsParser, PromptCache, QualityClassifier, ShellStageRunner, StageCommands,
    StageResult, StructuredFailure,
};
use builddag::fs::mock::MockFileSystem;
use builddag::types::{FailureCategory, Stage};

fn library(id: &str, path: &str) -> UnitSpec {
    UnitSpec {
        path: PathBuf::from(path),
        category: Some("library".to_string()),
        ..UnitSpec::new(id)
    }
}

#[test]
fn commands_are_substituted_and_overridden_per_unit() {
    let defaults = StageCommands {
        build: Some("make -C {path} {unit}".to_string()),
        test: Some("run-tests --kind {category}".to_string()),
        ..StageCommands::default()
    };
    let runner = ShellStageRunner::new(defaults, "/work").with_override(
        "special",
        StageCommands {
            test: Some("special-tests {unit}".to_string()),
            ..StageCommands::default()
        },
    );

    let core = library("core", "crates/core");
    assert_eq!(
        runner.command_for(&core, Stage::Building).as_deref(),
        Some("make -C /work/crates/core core")
    );
    assert_eq!(
        runner.command_for(&core, Stage::Testing).as_deref(),
        Some("run-tests --kind library")
    );

    let special = UnitSpec::new("special");
    assert_eq!(
        runner.command_for(&special, Stage::Testing).as_deref(),
        Some("special-tests special")
    );
    // The override leaves the other stages on their defaults.
    assert_eq!(
        runner.command_for(&special, Stage::Building).as_deref(),
        Some("make -C /work/special special")
    );
    assert_eq!(runner.command_for(&special, Stage::QualityChecking), None);
    assert_eq!(runner.command_for(&special, Stage::VerifyingDeps), None);
}

#[cfg(unix)]
mod shell {
    use super::*;
    use builddag::exec::{RemediationOracle, RemediationRequest, RemediationResponse, ShellOracle, StageRunner};

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("pkg")).expect("unit dir");
        dir
    }

    #[tokio::test]
    async fn shell_runner_reports_pass_fail_and_skipped_stages() -> TestResult {
        init_tracing();
        let dir = workspace();
        let runner = ShellStageRunner::new(
            StageCommands {
                build: Some("echo building {unit} in $(basename $(pwd))".to_string()),
                test: Some("echo 'assertion failed' >&2; exit 3".to_string()),
                ..StageCommands::default()
            },
            dir.path(),
        );
        let unit = UnitSpec::new("pkg");

        let build = with_timeout(runner.run(&unit, Stage::Building)).await?;
        assert!(build.success);
        assert_eq!(build.output.trim(), "building pkg in pkg");

        let test = with_timeout(runner.run(&unit, Stage::Testing)).await?;
        assert!(!test.success);
        assert!(test.output.contains("assertion failed"));

        let publish = with_timeout(runner.run(&unit, Stage::Publishing)).await?;
        assert!(publish.success);
        assert!(publish.output.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_unit_directory_is_an_infrastructure_error() {
        let dir = workspace();
        let runner = ShellStageRunner::new(
            StageCommands {
                build: Some("true".to_string()),
                ..StageCommands::default()
            },
            dir.path(),
        );

        let result = runner.run(&UnitSpec::new("not-there"), Stage::Building).await;
        assert!(result.is_err());
    }

    fn request(dir: &std::path::Path) -> RemediationRequest {
        RemediationRequest {
            unit_id: "pkg".to_string(),
            unit_path: dir.join("pkg"),
            plan: Some("plans/pkg.md".to_string()),
            attempt: 1,
            failures: vec![FailureCategory::Lint],
            output: "warning: unused import".to_string(),
            prompt: "fix it".to_string(),
        }
    }

    #[tokio::test]
    async fn shell_oracle_speaks_json_over_stdio() -> TestResult {
        init_tracing();
        let dir = workspace();
        let req = request(dir.path());

        // Echo a field of the request back to prove it arrived on stdin.
        let oracle = ShellOracle::new(
            r#"unit=$(sed -n 's/.*"unit_id":"\([^"]*\)".*/\1/p'); echo "{\"applied\": true, \"touched\": \"$unit\"}""#,
            dir.path(),
        );
        let response = with_timeout(oracle.remediate(&req)).await?;
        assert!(response.was_applied());
        assert_eq!(response.advisory()["touched"], "pkg");

        let oracle = ShellOracle::new(
            r#"cat > /dev/null; echo '{"applied": false, "reason": "needs a human"}'"#,
            dir.path(),
        );
        let response = with_timeout(oracle.remediate(&req)).await?;
        assert_eq!(
            response,
            RemediationResponse::NotApplied {
                reason: Some("needs a human".to_string()),
                advisory: BTreeMap::new(),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn shell_oracle_failures_are_errors() {
        let dir = workspace();
        let req = request(dir.path());

        let exited = ShellOracle::new("cat > /dev/null; exit 4", dir.path());
        let err = with_timeout(exited.remediate(&req)).await.unwrap_err();
        assert!(err.to_string().contains("status 4"), "{err}");

        let garbled = ShellOracle::new("cat > /dev/null; echo 'sure, fixed it'", dir.path());
        assert!(with_timeout(garbled.remediate(&req)).await.is_err());
    }
}

#[test]
fn classifier_uses_builtin_rules_and_falls_back_to_other() {
    let classifier = QualityClassifier::default();

    let output = "error[E0308]: mismatched types\nwarning: unused variable `x`\nWould reformat src/lib.rs\n";
    assert_eq!(
        classifier.categorize(&StageResult::failed(output)),
        vec![
            FailureCategory::Lint,
            FailureCategory::TypeCheck,
            FailureCategory::Format
        ]
    );

    assert_eq!(
        classifier.categorize(&StageResult::failed("gate said no")),
        vec![FailureCategory::Other]
    );
}

#[test]
fn structured_failures_win_over_output_matching() {
    let classifier = QualityClassifier::default();
    let result = StageResult::failed("clippy: 12 warnings").with_failures(vec![
        StructuredFailure {
            category: FailureCategory::Coverage,
            message: "71% < 80%".to_string(),
        },
        StructuredFailure {
            category: FailureCategory::Coverage,
            message: "branch coverage".to_string(),
        },
    ]);

    assert_eq!(classifier.categorize(&result), vec![FailureCategory::Coverage]);
}

#[test]
fn configured_rules_are_tried_first() {
    let mut extra = BTreeMap::new();
    extra.insert("coverage".to_string(), "^MISSING LINES".to_string());
    extra.insert("style".to_string(), "anything".to_string());
    let classifier = QualityClassifier::with_extra(&extra);

    assert_eq!(
        classifier.categorize(&StageResult::failed("MISSING LINES: 12 (lint pass ok)")),
        vec![FailureCategory::Coverage]
    );
    assert_eq!(
        classifier.categorize(&StageResult::failed("anything")),
        vec![FailureCategory::Other]
    );
}

#[test]
fn metrics_take_the_last_reported_value() {
    let parser = MetricsParser::default();
    let output = "\
coverage: 62.0%
TOTAL coverage 85.5%
Your code has been rated at 7.25/10
Found 3 errors in 2 files
";
    let metrics = parser.parse(output);
    assert_eq!(metrics.coverage_percent, Some(85.5));
    assert_eq!(metrics.lint_score, Some(7.25));
    assert_eq!(metrics.type_errors, Some(3));

    let empty = parser.parse("all good");
    assert_eq!(empty.coverage_percent, None);
    assert_eq!(empty.lint_score, None);
    assert_eq!(empty.type_errors, None);
}

#[test]
fn prompt_keys_are_sorted_and_deduplicated() {
    assert_eq!(
        PromptCache::key(&[
            FailureCategory::Format,
            FailureCategory::Lint,
            FailureCategory::Format
        ]),
        "lint+format"
    );
    assert_eq!(PromptCache::key(&[FailureCategory::TypeCheck]), "type_check");
}

#[test]
fn prompt_cache_prefers_tuned_prompts_and_caches() {
    init_tracing();
    let fs = MockFileSystem::new();
    fs.add_file("prompts/lint+type_check.md", "Tuned lint and types prompt.");
    let cache = PromptCache::with_fs(Some(PathBuf::from("prompts")), Arc::new(fs.clone()));
    assert!(cache.is_empty());

    let (key, tuned) = cache.get_or_build(&[FailureCategory::TypeCheck, FailureCategory::Lint]);
    assert_eq!(key, "lint+type_check");
    assert_eq!(&*tuned, "Tuned lint and types prompt.");

    let (key, synthesized) = cache.get_or_build(&[FailureCategory::Coverage]);
    assert_eq!(key, "coverage");
    assert!(synthesized.starts_with("The quality gate failed for this unit (coverage)"));
    assert!(synthesized.contains("Add tests"));

    // Cached: a later edit to the tuned prompt is not picked up.
    fs.add_file("prompts/lint+type_check.md", "Edited.");
    let (_, again) = cache.get_or_build(&[FailureCategory::Lint, FailureCategory::TypeCheck]);
    assert!(Arc::ptr_eq(&tuned, &again));
    assert_eq!(cache.len(), 2);

    // Clones share the same entries.
    let shared = cache.clone();
    shared.get_or_build(&[FailureCategory::Other]);
    assert_eq!(cache.len(), 3);
}

#[tokio::test]
async fn cancel_flag_wakes_waiters() -> TestResult {
    let flag = CancelFlag::new();
    assert!(!flag.is_cancelled());

    let waiter = {
        let flag = flag.clone();
        tokio::spawn(async move { flag.cancelled().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    flag.cancel();
    with_timeout(waiter).await?;
    assert!(flag.is_cancelled());

    // Already cancelled: resolves immediately.
    with_timeout(flag.cancelled()).await;
    Ok(())
}
