// src/engine/runtime.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::errors::Result;
use crate::exec::{LaunchRequest, PipelineBackend};
use crate::types::{UnitId, UnitStatus};
use crate::workqueue::{bounded, UnitRef, WorkQueueClient};

use super::checkpoint::CheckpointStore;
use super::core::CoreRuntime;
use super::{CoreCommand, IntakeSource, RuntimeEvent};

/// Timing knobs for the IO shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub registry_timeout: Duration,
    pub checkpoint_interval: Duration,
    /// How long pipelines get to wind down when the runtime exits.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            registry_timeout: Duration::from_secs(10),
            checkpoint_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            poll_interval: cfg.timings.poll_interval,
            registry_timeout: cfg.timings.registry_timeout,
            checkpoint_interval: cfg.timings.checkpoint_interval,
            ..Self::default()
        }
    }
}

/// Drives the orchestrator core in response to `RuntimeEvent`s and delegates
/// pipelines to a `PipelineBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// scheduling semantics. It owns the mailbox, the work-queue poller, retry
/// and checkpoint timers, and the checkpoint file.
pub struct Runtime<B: PipelineBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    event_tx: mpsc::Sender<RuntimeEvent>,
    backend: B,
    registry: Arc<dyn WorkQueueClient>,
    checkpoints: Option<CheckpointStore>,
    settings: RuntimeSettings,
    poll_epoch: watch::Sender<u64>,
    poll_now: Arc<Notify>,
    timers: Vec<AbortHandle>,
    /// Terminal statuses the registry has not accepted yet. Dependents are
    /// verified against the registry, so these are re-sent before every launch.
    unacknowledged: BTreeMap<UnitId, (UnitStatus, Option<String>)>,
}

impl<B: PipelineBackend> fmt::Debug for Runtime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<B: PipelineBackend> Runtime<B> {
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        event_tx: mpsc::Sender<RuntimeEvent>,
        backend: B,
        registry: Arc<dyn WorkQueueClient>,
        settings: RuntimeSettings,
    ) -> Self {
        let (poll_epoch, _) = watch::channel(core.completion_epoch());
        Self {
            core,
            event_rx,
            event_tx,
            backend,
            registry,
            checkpoints: None,
            settings,
            poll_epoch,
            poll_now: Arc::new(Notify::new()),
            timers: Vec::new(),
            unacknowledged: BTreeMap::new(),
        }
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Main event loop.
    ///
    /// - Executes `initial` commands (from a checkpoint restore) first.
    /// - Consumes `RuntimeEvent`s from the mailbox, one at a time.
    /// - Feeds them into the core and executes the commands it returns.
    ///
    /// Returns the final core state so the caller can build the suite outcome.
    pub async fn run(mut self, initial: Vec<CoreCommand>) -> Result<CoreRuntime> {
        info!("builddag runtime started");

        let poller = spawn_poller(
            Arc::clone(&self.registry),
            self.event_tx.clone(),
            self.poll_epoch.subscribe(),
            Arc::clone(&self.poll_now),
            self.settings,
        );
        let checkpoint_timer = self
            .checkpoints
            .as_ref()
            .map(|_| spawn_checkpoint_timer(self.event_tx.clone(), self.settings.checkpoint_interval));

        let mut keep_running = true;
        for command in initial {
            keep_running &= self.execute_command(command).await?;
        }

        while keep_running {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("runtime event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            // Feed the event into the pure core and get commands back.
            let step = self.core.step(event);

            for command in step.commands {
                keep_running &= self.execute_command(command).await?;
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                keep_running = false;
            }
        }

        poller.abort();
        if let Some(timer) = checkpoint_timer {
            timer.abort();
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }

        self.resend_unacknowledged().await;
        if !self.unacknowledged.is_empty() {
            let units: Vec<_> = self.unacknowledged.keys().collect();
            warn!(?units, "registry never accepted final statuses");
        }

        self.backend.shutdown(self.settings.shutdown_grace).await?;

        info!("runtime exiting");
        Ok(self.core)
    }

    /// Execute a single command from the core. Returns `false` on
    /// `RequestExit`.
    async fn execute_command(&mut self, command: CoreCommand) -> Result<bool> {
        match command {
            CoreCommand::Launch(requests) => {
                self.resend_unacknowledged().await;
                self.launch(requests).await?;
            }
            CoreCommand::ScheduleRetry { unit, delay } => {
                debug!(unit = %unit, ?delay, "scheduling retry timer");
                let tx = self.event_tx.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(RuntimeEvent::RetryDue { unit }).await;
                });
                self.timers.retain(|t| !t.is_finished());
                self.timers.push(handle.abort_handle());
            }
            CoreCommand::ReportStatus {
                unit,
                status,
                detail,
            } => {
                // A newer status supersedes one still waiting to be re-sent.
                self.unacknowledged.remove(&unit);
                let call = self.registry.report_status(unit.clone(), status, detail.clone());
                match bounded(self.settings.registry_timeout, call).await {
                    Ok(()) => debug!(unit = %unit, %status, "status reported"),
                    Err(err) if status.is_terminal() => {
                        warn!(unit = %unit, %status, error = %err, "failed to report status; will re-send");
                        self.unacknowledged.insert(unit, (status, detail));
                    }
                    Err(err) => {
                        warn!(unit = %unit, %status, error = %err, "failed to report status; continuing")
                    }
                }
            }
            CoreCommand::CancelExecutions(ids) => {
                self.backend.cancel(ids).await?;
            }
            CoreCommand::Checkpoint(snapshot) => {
                if let Some(store) = &self.checkpoints {
                    if let Err(err) = store.save(&snapshot) {
                        warn!(path = %store.path().display(), error = %err, "failed to write checkpoint");
                    }
                }
            }
            CoreCommand::DiscardCheckpoint => {
                if let Some(store) = &self.checkpoints {
                    if let Err(err) = store.discard() {
                        warn!(path = %store.path().display(), error = %err, "failed to remove checkpoint");
                    }
                }
            }
            CoreCommand::RequestPoll { epoch } => {
                self.poll_epoch.send_replace(epoch);
                self.poll_now.notify_one();
            }
            CoreCommand::RequestExit => {
                info!("core issued RequestExit command");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Re-send terminal statuses the registry rejected earlier, stopping at
    /// the first one that still fails.
    async fn resend_unacknowledged(&mut self) {
        while let Some((unit, (status, detail))) = self.unacknowledged.pop_first() {
            let call = self.registry.report_status(unit.clone(), status, detail.clone());
            match bounded(self.settings.registry_timeout, call).await {
                Ok(()) => info!(unit = %unit, %status, "status re-sent"),
                Err(err) => {
                    debug!(unit = %unit, %status, error = %err, "status re-send failed");
                    self.unacknowledged.insert(unit, (status, detail));
                    break;
                }
            }
        }
    }

    async fn launch(&mut self, requests: Vec<LaunchRequest>) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let units: Vec<_> = requests.iter().map(|r| r.unit.id.as_str()).collect();
        debug!(?units, "launching ready units");

        self.backend.launch(requests).await?;
        Ok(())
    }
}

/// Poll `fetch_ready` on an interval, or sooner when asked.
///
/// Every finished poll is delivered, even an empty or failed one, so the core
/// can tell that intake has caught up with its latest completion.
fn spawn_poller(
    registry: Arc<dyn WorkQueueClient>,
    tx: mpsc::Sender<RuntimeEvent>,
    epoch: watch::Receiver<u64>,
    poll_now: Arc<Notify>,
    settings: RuntimeSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let started_in = *epoch.borrow();

            let units = match bounded(settings.registry_timeout, registry.fetch_ready()).await {
                Ok(refs) => {
                    debug!(count = refs.len(), "fetched ready units");
                    refs.into_iter().map(UnitRef::into_spec).collect()
                }
                Err(err) => {
                    warn!(error = %err, "work queue poll failed; continuing on internal queue");
                    Vec::new()
                }
            };

            let event = RuntimeEvent::UnitsArrived {
                units,
                source: IntakeSource::Registry { epoch: started_in },
            };
            if tx.send(event).await.is_err() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                _ = poll_now.notified() => {}
            }
        }
    })
}

fn spawn_checkpoint_timer(tx: mpsc::Sender<RuntimeEvent>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if tx.send(RuntimeEvent::CheckpointDue).await.is_err() {
                break;
            }
        }
    })
}
