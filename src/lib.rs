// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod report;
pub mod types;
pub mod workqueue;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::dag::{DependencyGraph, UnitSpec};
use crate::engine::{
    CheckpointStore, ControlCommand, CoreCommand, CoreRuntime, IntakeSource, Runtime,
    RuntimeEvent, RuntimeOptions, RuntimeSettings,
};
use crate::exec::{
    PipelineContext, PipelineSettings, PromptCache, QualityClassifier, ShellOracle,
    ShellStageRunner, TokioPipelineBackend,
};
use crate::fs::{FileSystem, RealFileSystem};
use crate::report::{spawn_aggregator, ExecutionReport, ReportAggregator, ReportWriter};
use crate::types::{RegistryKind, Stage};
use crate::workqueue::{FileRegistry, ManifestRegistry, WorkQueueClient};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the work queue client (manifest or file)
/// - pipeline context, backend and report aggregation
/// - checkpoint restore
/// - the runtime and Ctrl-C handling
///
/// Returns `false` when the process should exit non-zero: a `--once` run with
/// failed units, or a failed suite publish.
pub async fn run(args: CliArgs) -> Result<bool> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let base_dir = config_root_dir(&config_path);

    if args.dry_run {
        print_dry_run(&cfg, &base_dir)?;
        return Ok(true);
    }

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let manifest = manifest_units(&cfg);

    let registry: Arc<dyn WorkQueueClient> = match cfg.registry.kind {
        RegistryKind::Manifest => Arc::new(ManifestRegistry::new(&manifest)),
        RegistryKind::File => {
            let path = cfg
                .registry
                .path
                .as_ref()
                .map(|p| base_dir.join(p))
                .context("[registry].path is required when kind = \"file\"")?;
            info!(path = %path.display(), "using file work queue");
            Arc::new(FileRegistry::with_fs(path, Arc::clone(&fs)))
        }
    };

    // Reports flow from pipelines to the aggregator until every sender drops.
    let (report_tx, report_rx) = mpsc::unbounded_channel::<ExecutionReport>();
    let writer = ReportWriter::new(base_dir.join(&cfg.orchestrator.report_dir), Arc::clone(&fs));
    let aggregator = spawn_aggregator(ReportAggregator::new(Some(writer)), report_rx);

    let ctx = pipeline_context(&cfg, &base_dir, Arc::clone(&registry), report_tx);

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    let backend = TokioPipelineBackend::new(Arc::new(ctx), rt_tx.clone());

    let options = RuntimeOptions::from_config(&cfg, args.once);
    let store = CheckpointStore::new(
        base_dir.join(&cfg.orchestrator.checkpoint_path),
        Arc::clone(&fs),
    );

    let (core, initial) = restore_or_start(&store, options, &args)?;

    // An explicit --concurrency beats both the config and a restored limit.
    if let Some(limit) = args.concurrency {
        rt_tx
            .send(RuntimeEvent::Control(ControlCommand::AdjustConcurrency(limit)))
            .await?;
    }

    // Seed the manifest; units the checkpoint already tracks are ignored.
    if !manifest.is_empty() {
        info!(units = manifest.len(), "seeding units from manifest");
        rt_tx
            .send(RuntimeEvent::UnitsArrived {
                units: manifest,
                source: IntakeSource::Manual,
            })
            .await?;
    }

    let ctrl_c = spawn_ctrl_c_listener(rt_tx.clone());

    let runtime = Runtime::new(
        core,
        rt_rx,
        rt_tx,
        backend,
        Arc::clone(&registry),
        RuntimeSettings::from_config(&cfg),
    )
    .with_checkpoints(store);

    let core = runtime.run(initial).await?;
    ctrl_c.abort();

    let aggregator = aggregator.await.context("report aggregator task failed")?;
    let summary = aggregator.finish(&core.outcome());

    let mut ok = true;
    if let Some(cmd) = cfg.suite.publish_cmd.as_deref() {
        if summary.suite_success {
            if let Err(err) = run_suite_publish(cmd, &base_dir).await {
                error!(error = %format!("{err:#}"), "suite publish failed");
                ok = false;
            }
        } else {
            warn!(
                failed = ?summary.failed,
                blocked = ?summary.blocked,
                "suite publish suppressed; not every unit completed"
            );
        }
    }

    if args.once && !summary.failed.is_empty() {
        ok = false;
    }
    Ok(ok)
}

/// Load the checkpoint (unless `--fresh`) or start an empty core.
fn restore_or_start(
    store: &CheckpointStore,
    options: RuntimeOptions,
    args: &CliArgs,
) -> Result<(CoreRuntime, Vec<CoreCommand>)> {
    if args.fresh {
        if store.path().exists() {
            info!(path = %store.path().display(), "--fresh given; ignoring existing checkpoint");
        }
        return Ok((CoreRuntime::new(options), Vec::new()));
    }

    match store.load()? {
        Some(snapshot) => {
            info!(path = %store.path().display(), saved_at = %snapshot.saved_at, "resuming from checkpoint");
            Ok(CoreRuntime::restore(snapshot, options)?)
        }
        None => Ok((CoreRuntime::new(options), Vec::new())),
    }
}

fn pipeline_context(
    cfg: &ConfigFile,
    base_dir: &Path,
    registry: Arc<dyn WorkQueueClient>,
    reports: mpsc::UnboundedSender<ExecutionReport>,
) -> PipelineContext {
    let stages = Arc::new(ShellStageRunner::from_config(cfg, base_dir));
    let prompt_dir = cfg.remediation.prompt_dir.as_ref().map(|d| base_dir.join(d));

    let ctx = PipelineContext::new(stages, registry, reports)
        .with_prompts(PromptCache::new(prompt_dir))
        .with_classifier(QualityClassifier::with_extra(&cfg.stages.categories))
        .with_settings(PipelineSettings::from_config(cfg, base_dir));

    match cfg.remediation.cmd.as_deref() {
        Some(cmd) => ctx.with_oracle(Arc::new(ShellOracle::new(cmd, base_dir))),
        None => {
            debug!("no [remediation].cmd; quality failures are terminal");
            ctx
        }
    }
}

/// Ctrl-C once drains, twice stops immediately.
fn spawn_ctrl_c_listener(tx: mpsc::Sender<RuntimeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut presses = 0u32;
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            presses += 1;

            let command = if presses == 1 {
                warn!("Ctrl-C received; draining running pipelines (press again to stop now)");
                ControlCommand::Drain
            } else {
                warn!("second Ctrl-C; emergency stop");
                ControlCommand::EmergencyStop
            };

            if tx.send(RuntimeEvent::Control(command)).await.is_err() || presses > 1 {
                return;
            }
        }
    })
}

async fn run_suite_publish(cmd: &str, base_dir: &Path) -> Result<()> {
    info!(cmd = %cmd, "running suite publish");

    let status = exec::stages::shell_command(cmd)
        .current_dir(base_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("spawning suite publish '{cmd}'"))?;

    if !status.success() {
        anyhow::bail!(
            "suite publish exited with status {}",
            status.code().unwrap_or(-1)
        );
    }
    info!("suite publish finished");
    Ok(())
}

/// Directory that relative paths in the config resolve against.
///
/// - If the config path has a non-empty parent (e.g. "ci/Builddag.toml"),
///   we use that directory.
/// - If it's just a bare filename like "Builddag.toml" (parent = ""),
///   we fall back to the current working directory "."
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

fn manifest_units(cfg: &ConfigFile) -> Vec<UnitSpec> {
    cfg.unit
        .iter()
        .map(|(id, unit)| UnitSpec::from_config(id, unit))
        .collect()
}

/// Dry-run output: units by layer with their effective stage commands.
fn print_dry_run(cfg: &ConfigFile, base_dir: &Path) -> Result<()> {
    let graph = DependencyGraph::build(manifest_units(cfg))?;
    let stages = ShellStageRunner::from_config(cfg, base_dir);

    println!("builddag dry-run");
    println!("  orchestrator.concurrency = {}", cfg.orchestrator.concurrency);
    println!("  orchestrator.max_retries = {}", cfg.orchestrator.max_retries);
    println!("  orchestrator.backoff = {:?}", cfg.orchestrator.backoff);
    println!("  registry.kind = {:?}", cfg.registry.kind);
    println!(
        "  remediation = {}",
        cfg.remediation.cmd.as_deref().unwrap_or("(none)")
    );
    println!();

    println!("units ({}):", graph.len());
    for (layer, ids) in graph.ids_by_layer() {
        println!("  layer {layer}:");
        for id in ids {
            let Some(spec) = graph.spec(&id) else {
                continue;
            };
            println!("    - {id}");
            println!("        path: {}", spec.path.display());
            if !spec.dependencies.is_empty() {
                println!("        after: {:?}", spec.dependencies);
            }
            let external = graph.external_dependencies_of(&id);
            if !external.is_empty() {
                println!("        external: {:?}", external);
            }
            if let Some(ref category) = spec.category {
                println!("        category: {category}");
            }
            if let Some(ref plan) = spec.plan {
                println!("        plan: {plan}");
            }
            for stage in [
                Stage::Building,
                Stage::Testing,
                Stage::QualityChecking,
                Stage::Publishing,
            ] {
                if let Some(cmd) = stages.command_for(spec, stage) {
                    println!("        {stage}: {cmd}");
                }
            }
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
