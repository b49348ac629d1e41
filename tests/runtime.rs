// tests/runtime.rs
mod common;
use crate::common::{init_tracing, unit, with_timeout, TestResult};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use builddag::dag::UnitSpec;
use builddag::engine::{
    Backoff, CheckpointStore, ControlHandle, CoreRuntime, IntakeSource, Progress, Runtime,
    RuntimeEvent, RuntimeOptions, RuntimeSettings,
};
use builddag::exec::{
    LaunchRequest, PipelineBackend, PipelineContext, PipelineFailure, PipelineOutcome,
    TokioPipelineBackend,
};
use builddag::fs::RealFileSystem;
use builddag::report::ExecutionStatus;
use builddag::types::{BackoffPolicy, ControlState, ExecutionId, Stage, UnitId, UnitStatus};
use builddag::workqueue::{
    ManifestRegistry, RegistryError, RegistryFuture, UnitRef, WorkQueueClient,
};
use builddag_test_utils::fake_backend::FakeBackend;
use builddag_test_utils::scripted::ScriptedStageRunner;
use tokio::sync::mpsc;

fn options(concurrency: usize, once: bool) -> RuntimeOptions {
    RuntimeOptions {
        exit_when_idle: once,
        concurrency,
        backoff: Backoff {
            policy: BackoffPolicy::Exponential,
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
        },
        requeue_delay: Duration::from_millis(10),
        ..RuntimeOptions::default()
    }
}

fn settings() -> RuntimeSettings {
    RuntimeSettings {
        poll_interval: Duration::from_millis(20),
        registry_timeout: Duration::from_secs(1),
        checkpoint_interval: Duration::from_secs(60),
        shutdown_grace: Duration::from_millis(100),
    }
}

fn seed(units: Vec<UnitSpec>) -> RuntimeEvent {
    RuntimeEvent::UnitsArrived {
        units,
        source: IntakeSource::Manual,
    }
}

fn runtime<B: PipelineBackend>(
    options: RuntimeOptions,
    channel: (mpsc::Sender<RuntimeEvent>, mpsc::Receiver<RuntimeEvent>),
    backend: B,
    registry: Arc<dyn WorkQueueClient>,
) -> Runtime<B> {
    let (tx, rx) = channel;
    Runtime::new(CoreRuntime::new(options), rx, tx, backend, registry, settings())
}

/// Poll progress until `done` holds.
async fn eventually(handle: &ControlHandle, done: impl Fn(&Progress) -> bool) -> Progress {
    with_timeout(async {
        loop {
            let progress = handle.progress().await.expect("runtime answers queries");
            if done(&progress) {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

fn position(order: &[String], id: &str) -> usize {
    order
        .iter()
        .position(|u| u == id)
        .unwrap_or_else(|| panic!("{id} never started: {order:?}"))
}

#[tokio::test]
async fn once_mode_builds_the_manifest_and_exits() -> TestResult {
    init_tracing();
    let units = vec![unit("a", &[]), unit("b", &["a"]), unit("c", &[])];
    let registry = Arc::new(ManifestRegistry::new(&units));
    let (tx, rx) = mpsc::channel(64);
    let backend = FakeBackend::new(tx.clone());
    let launched = backend.launched();

    tx.send(seed(units)).await?;
    let core = with_timeout(runtime(options(2, true), (tx, rx), backend, registry.clone()).run(Vec::new()))
        .await?;

    let outcome = core.outcome();
    assert_eq!(outcome.completed, vec!["a", "b", "c"]);
    assert!(outcome.failed.is_empty());
    assert!(outcome.blocked.is_empty());

    for id in ["a", "b", "c"] {
        assert_eq!(registry.status_of(id), Some(UnitStatus::Completed), "{id}");
    }

    let order: Vec<String> = launched.lock().unwrap().iter().map(|r| r.unit.id.clone()).collect();
    assert_eq!(order.len(), 3);
    assert!(position(&order, "a") < position(&order, "b"));
    Ok(())
}

#[tokio::test]
async fn once_mode_exits_with_failed_and_blocked_units() -> TestResult {
    init_tracing();
    let units = vec![unit("a", &[]), unit("b", &["a"]), unit("c", &[])];
    let registry = Arc::new(ManifestRegistry::new(&units));
    let (tx, rx) = mpsc::channel(64);
    let backend = FakeBackend::new(tx.clone()).with_outcomes(
        "a",
        vec![PipelineOutcome::Failed(PipelineFailure::Build {
            message: "linker error".to_string(),
        })],
    );

    tx.send(seed(units)).await?;
    let core = with_timeout(runtime(options(2, true), (tx, rx), backend, registry.clone()).run(Vec::new()))
        .await?;

    let outcome = core.outcome();
    assert_eq!(outcome.completed, vec!["c"]);
    assert_eq!(outcome.failed, vec!["a"]);
    assert_eq!(outcome.blocked, vec!["b"]);
    assert_eq!(registry.status_of("a"), Some(UnitStatus::Failed));
    Ok(())
}

#[tokio::test]
async fn infrastructure_failures_are_retried_by_the_runtime() -> TestResult {
    init_tracing();
    let units = vec![unit("flaky", &[])];
    let registry = Arc::new(ManifestRegistry::new(&units));
    let (tx, rx) = mpsc::channel(64);
    let backend = FakeBackend::new(tx.clone()).with_outcomes(
        "flaky",
        vec![
            PipelineOutcome::Failed(PipelineFailure::Infrastructure {
                stage: Stage::Building,
                message: "runner disconnected".to_string(),
            }),
            PipelineOutcome::Succeeded,
        ],
    );
    let launched = backend.launched();

    tx.send(seed(units)).await?;
    let core = with_timeout(runtime(options(1, true), (tx, rx), backend, registry).run(Vec::new()))
        .await?;

    assert_eq!(core.completed(), vec!["flaky"]);
    let attempts: Vec<u32> = launched.lock().unwrap().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn operator_controls_pause_resume_and_drain() -> TestResult {
    init_tracing();
    let units = vec![unit("a", &[]), unit("b", &["a"]), unit("c", &[])];
    let registry = Arc::new(ManifestRegistry::new(&units));
    let (tx, rx) = mpsc::channel(64);
    let backend = FakeBackend::new(tx.clone());
    let launched = backend.launched();
    let handle = ControlHandle::new(tx.clone());

    handle.pause().await?;
    handle.enqueue(units).await?;
    let task = tokio::spawn(runtime(options(2, false), (tx, rx), backend, registry).run(Vec::new()));

    let progress = eventually(&handle, |p| p.total() == 3).await;
    assert_eq!(progress.control_state, ControlState::Paused);
    assert_eq!(progress.running, 0);
    assert_eq!(progress.queued, 2);
    assert_eq!(progress.pending, 1);
    assert_eq!(handle.unit_status("b").await?, Some(UnitStatus::Pending));
    assert_eq!(handle.unit_status("unknown").await?, None);
    assert!(launched.lock().unwrap().is_empty());

    handle.adjust_concurrency(1).await?;
    handle.resume().await?;

    let progress = eventually(&handle, |p| p.completed == 3).await;
    assert_eq!(progress.concurrency_limit, 1);
    assert_eq!(progress.control_state, ControlState::Running);
    assert!(handle.failed().await?.is_empty());
    assert!(handle.active().await?.is_empty());

    handle.drain().await?;
    let core = with_timeout(task).await??;
    assert_eq!(core.control_state(), ControlState::Terminated);
    assert_eq!(launched.lock().unwrap().len(), 3);

    // The runtime is gone; the handle reports that instead of hanging.
    assert!(handle.progress().await.is_err());
    Ok(())
}

#[tokio::test]
async fn emergency_stop_cancels_running_work_and_drops_the_checkpoint() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("checkpoint.json");

    let units = vec![unit("slow", &[]), unit("quick", &[])];
    let registry = Arc::new(ManifestRegistry::new(&units));
    let (tx, rx) = mpsc::channel(64);
    let backend = FakeBackend::new(tx.clone()).hold("slow");
    let cancelled = backend.cancelled();
    let handle = ControlHandle::new(tx.clone());

    let mut opts = options(2, false);
    opts.checkpoint_every = 1;
    let rt = runtime(opts, (tx.clone(), rx), backend, registry)
        .with_checkpoints(CheckpointStore::new(&path, Arc::new(RealFileSystem)));

    tx.send(seed(units)).await?;
    let task = tokio::spawn(rt.run(Vec::new()));

    eventually(&handle, |p| p.completed == 1 && p.running == 1).await;

    // "quick" finishing triggered a checkpoint with "slow" still in flight.
    let snapshot = CheckpointStore::new(&path, Arc::new(RealFileSystem))
        .load()?
        .expect("checkpoint written after a terminal result");
    assert_eq!(snapshot.completed, vec!["quick"]);
    assert_eq!(snapshot.in_flight.len(), 1);
    assert_eq!(snapshot.in_flight[0].unit, "slow");

    handle.emergency_stop().await?;
    let core = with_timeout(task).await??;

    assert_eq!(core.control_state(), ControlState::EmergencyStopped);
    assert_eq!(
        cancelled.lock().unwrap().clone(),
        vec![snapshot.in_flight[0].execution_id.clone()]
    );
    assert!(!path.exists(), "emergency stop discards the checkpoint");
    Ok(())
}

#[tokio::test]
async fn tokio_backend_runs_real_pipelines_within_the_concurrency_cap() -> TestResult {
    init_tracing();
    let units = vec![
        unit("a", &[]),
        unit("b", &["a"]),
        unit("c", &[]),
        unit("d", &["b", "c"]),
    ];
    let runner = Arc::new(ScriptedStageRunner::new().with_delay(Duration::from_millis(20)));
    let registry = Arc::new(ManifestRegistry::new(&units));
    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let ctx = Arc::new(PipelineContext::new(runner.clone(), registry.clone(), report_tx));

    let (tx, rx) = mpsc::channel(64);
    let backend = TokioPipelineBackend::new(ctx, tx.clone());

    tx.send(seed(units)).await?;
    let core = with_timeout(runtime(options(2, true), (tx, rx), backend, registry.clone()).run(Vec::new()))
        .await?;

    assert_eq!(core.completed(), vec!["a", "b", "c", "d"]);
    assert_eq!(runner.max_running(), 2);

    let order = runner.build_order();
    assert!(position(&order, "a") < position(&order, "b"));
    assert!(position(&order, "b") < position(&order, "d"));
    assert!(position(&order, "c") < position(&order, "d"));

    let mut statuses = Vec::new();
    while let Ok(report) = reports.try_recv() {
        statuses.push((report.unit_id, report.status));
    }
    assert_eq!(statuses.len(), 4);
    assert!(statuses.iter().all(|(_, s)| *s == ExecutionStatus::Succeeded));
    Ok(())
}

/// Registry that rejects the first few `Completed` writes for one unit.
struct FlakyWrites {
    inner: Arc<ManifestRegistry>,
    unit: &'static str,
    rejections: AtomicUsize,
}

impl WorkQueueClient for FlakyWrites {
    fn fetch_ready(&self) -> RegistryFuture<'_, Vec<UnitRef>> {
        self.inner.fetch_ready()
    }

    fn report_status(
        &self,
        unit: UnitId,
        status: UnitStatus,
        detail: Option<String>,
    ) -> RegistryFuture<'_, ()> {
        if unit == self.unit
            && status == UnitStatus::Completed
            && self
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Box::pin(async { Err::<(), _>(RegistryError::Unavailable("write rejected".to_string())) });
        }
        self.inner.report_status(unit, status, detail)
    }

    fn incomplete_dependencies(&self, deps: Vec<UnitId>) -> RegistryFuture<'_, Vec<UnitId>> {
        self.inner.incomplete_dependencies(deps)
    }
}

#[tokio::test]
async fn rejected_completion_report_is_resent_and_the_suite_finishes() -> TestResult {
    init_tracing();
    let units = vec![unit("a", &[]), unit("b", &["a"])];
    let manifest = Arc::new(ManifestRegistry::new(&units));
    let registry = Arc::new(FlakyWrites {
        inner: manifest.clone(),
        unit: "a",
        rejections: AtomicUsize::new(2),
    });
    let runner = Arc::new(ScriptedStageRunner::new());
    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let ctx = Arc::new(PipelineContext::new(runner.clone(), registry.clone(), report_tx));

    let (tx, rx) = mpsc::channel(64);
    let backend = TokioPipelineBackend::new(ctx, tx.clone());

    tx.send(seed(units)).await?;
    let core = with_timeout(runtime(options(1, true), (tx, rx), backend, registry.clone()).run(Vec::new()))
        .await?;

    assert_eq!(core.completed(), vec!["a", "b"]);
    assert_eq!(core.control_state(), ControlState::Terminated);
    assert_eq!(registry.rejections.load(Ordering::SeqCst), 0);
    assert_eq!(manifest.status_of("a"), Some(UnitStatus::Completed));
    assert_eq!(manifest.status_of("b"), Some(UnitStatus::Completed));
    assert_eq!(runner.build_order(), vec!["a", "b"]);

    // b was checked while the registry still had a as pending, then again
    // once the completion went through.
    let mut b_statuses = Vec::new();
    while let Ok(report) = reports.try_recv() {
        if report.unit_id == "b" {
            b_statuses.push(report.status);
        }
    }
    assert_eq!(
        b_statuses,
        vec![ExecutionStatus::Requeued, ExecutionStatus::Succeeded]
    );
    Ok(())
}

fn tokio_backend(
    stage_delay: Duration,
) -> (TokioPipelineBackend, mpsc::Receiver<RuntimeEvent>) {
    let runner = Arc::new(ScriptedStageRunner::new().with_delay(stage_delay));
    let registry = Arc::new(ManifestRegistry::default());
    let (report_tx, _reports) = mpsc::unbounded_channel();
    let ctx = Arc::new(PipelineContext::new(runner, registry, report_tx));
    let (tx, rx) = mpsc::channel(8);
    (TokioPipelineBackend::new(ctx, tx), rx)
}

fn launch_request(id: &str) -> LaunchRequest {
    LaunchRequest {
        unit: unit(id, &[]),
        execution_id: ExecutionId::from(format!("exec-{id}")),
        attempt: 1,
        waited: Duration::ZERO,
    }
}

#[tokio::test]
async fn shutdown_returns_as_soon_as_pipelines_finish() -> TestResult {
    init_tracing();
    let (mut backend, mut rx) = tokio_backend(Duration::from_millis(10));
    backend.launch(vec![launch_request("quick")]).await?;

    let started = tokio::time::Instant::now();
    with_timeout(backend.shutdown(Duration::from_secs(30))).await?;
    assert!(started.elapsed() < Duration::from_secs(1), "shutdown waited out the grace period");

    match rx.try_recv()? {
        RuntimeEvent::PipelineFinished { unit, outcome, .. } => {
            assert_eq!(unit, "quick");
            assert_eq!(outcome, PipelineOutcome::Succeeded);
        }
        other => panic!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn shutdown_aborts_pipelines_that_outlive_the_grace_period() -> TestResult {
    init_tracing();
    let (mut backend, mut rx) = tokio_backend(Duration::from_secs(60));
    backend.launch(vec![launch_request("slow")]).await?;

    let started = tokio::time::Instant::now();
    with_timeout(backend.shutdown(Duration::from_millis(50))).await?;
    assert!(started.elapsed() < Duration::from_secs(1));

    let event = with_timeout(rx.recv()).await;
    match event {
        Some(RuntimeEvent::PipelineFinished { unit, outcome, .. }) => {
            assert_eq!(unit, "slow");
            assert_eq!(outcome, PipelineOutcome::Cancelled);
        }
        other => panic!("unexpected event {other:?}"),
    }
    Ok(())
}
