//! Scripted stand-ins for the stage runner and the remediation oracle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use builddag::dag::UnitSpec;
use builddag::exec::remediation::OracleFuture;
use builddag::exec::stages::StageFuture;
use builddag::exec::{
    RemediationOracle, RemediationRequest, RemediationResponse, StageResult, StageRunner,
    StructuredFailure,
};
use builddag::types::Stage;

/// What one stage invocation does.
#[derive(Debug, Clone)]
pub enum Step {
    Pass,
    /// Ran and failed with this output.
    Fail(String),
    /// Ran and failed with pre-classified failures.
    FailWith(Vec<StructuredFailure>),
    /// Could not run at all.
    Error(String),
    /// Never finishes; only cancellation or a timeout ends it.
    Hang,
}

/// Stage runner driven by per-(unit, stage) scripts.
///
/// Steps are consumed in order and the last one repeats. Unscripted stages
/// pass. Every call sleeps for `delay` first, so overlapping pipelines can be
/// observed through `max_running`.
#[derive(Debug, Default)]
pub struct ScriptedStageRunner {
    scripts: Mutex<HashMap<(String, Stage), VecDeque<Step>>>,
    calls: Mutex<Vec<(String, Stage)>>,
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedStageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, unit: &str, stage: Stage, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert((unit.to_string(), stage), steps.into());
        self
    }

    /// Every (unit, stage) call so far, in call order.
    pub fn calls(&self) -> Vec<(String, Stage)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, unit: &str, stage: Stage) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, s)| u == unit && *s == stage)
            .count()
    }

    /// Units in the order their build stage started.
    pub fn build_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == Stage::Building)
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// Highest number of stage calls that were in flight at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_step(&self, unit: &str, stage: Stage) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&(unit.to_string(), stage)) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap_or(Step::Pass),
            Some(steps) => steps.front().cloned().unwrap_or(Step::Pass),
            None => Step::Pass,
        }
    }
}

/// Decrements the running counter even if the stage future is dropped.
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StageRunner for ScriptedStageRunner {
    fn run<'a>(&'a self, unit: &'a UnitSpec, stage: Stage) -> StageFuture<'a> {
        Box::pin(async move {
            self.calls.lock().unwrap().push((unit.id.clone(), stage));
            let step = self.next_step(&unit.id, stage);

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let _running = Running(&self.running);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            match step {
                Step::Pass => Ok(StageResult::passed(format!("{stage} ok"))),
                Step::Fail(output) => Ok(StageResult::failed(output)),
                Step::FailWith(failures) => {
                    Ok(StageResult::failed("structured failure").with_failures(failures))
                }
                Step::Error(message) => Err(anyhow!(message)),
                Step::Hang => std::future::pending().await,
            }
        })
    }
}

/// Oracle that answers from a queue of responses (the last one repeats) and
/// records every request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOracle {
    responses: Arc<Mutex<VecDeque<Result<RemediationResponse, String>>>>,
    requests: Arc<Mutex<Vec<RemediationRequest>>>,
}

impl ScriptedOracle {
    /// Always answers `applied: true`.
    pub fn applying() -> Self {
        Self::new(vec![Ok(RemediationResponse::applied(Default::default()))])
    }

    pub fn new(responses: Vec<Result<RemediationResponse, String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<RemediationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl RemediationOracle for ScriptedOracle {
    fn remediate<'a>(&'a self, request: &'a RemediationRequest) -> OracleFuture<'a> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());

            let next = {
                let mut responses = self.responses.lock().unwrap();
                if responses.len() > 1 {
                    responses.pop_front()
                } else {
                    responses.front().cloned()
                }
            };

            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Ok(RemediationResponse::not_applied("no scripted response")),
            }
        })
    }
}
