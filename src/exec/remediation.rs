// src/exec/remediation.rs

//! Remediation oracle contract and the shared prompt cache.
//!
//! The oracle is opaque: it receives a [`RemediationRequest`] describing the
//! failing quality gate and answers whether it applied a fix. Anything else it
//! says travels along as advisory data and ends up in the execution report.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::exec::stages::shell_command;
use crate::fs::{FileSystem, RealFileSystem};
use crate::types::{FailureCategory, UnitId};

/// Boxed future returned by [`RemediationOracle::remediate`].
pub type OracleFuture<'a> = Pin<Box<dyn Future<Output = Result<RemediationResponse>> + Send + 'a>>;

/// What the oracle is asked to fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub unit_id: UnitId,
    pub unit_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// 1-based.
    pub attempt: u32,
    pub failures: Vec<FailureCategory>,
    /// Tail of the failing quality output.
    pub output: String,
    pub prompt: String,
}

/// The oracle's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemediationResponse {
    Applied {
        advisory: BTreeMap<String, Value>,
    },
    NotApplied {
        reason: Option<String>,
        advisory: BTreeMap<String, Value>,
    },
}

/// Wire shape. `applied` is required and must be a boolean; every other
/// field is kept as advisory data.
#[derive(Debug, Deserialize)]
struct RawResponse {
    applied: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl RemediationResponse {
    pub fn applied(advisory: BTreeMap<String, Value>) -> Self {
        RemediationResponse::Applied { advisory }
    }

    pub fn not_applied(reason: impl Into<String>) -> Self {
        RemediationResponse::NotApplied {
            reason: Some(reason.into()),
            advisory: BTreeMap::new(),
        }
    }

    /// Parse a JSON response body.
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let raw: RawResponse = serde_json::from_str(body)?;
        Ok(if raw.applied {
            RemediationResponse::Applied { advisory: raw.extra }
        } else {
            RemediationResponse::NotApplied {
                reason: raw.reason,
                advisory: raw.extra,
            }
        })
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, RemediationResponse::Applied { .. })
    }

    pub fn advisory(&self) -> &BTreeMap<String, Value> {
        match self {
            RemediationResponse::Applied { advisory }
            | RemediationResponse::NotApplied { advisory, .. } => advisory,
        }
    }
}

/// Something that can try to fix a failing quality gate.
pub trait RemediationOracle: Send + Sync {
    fn remediate<'a>(&'a self, request: &'a RemediationRequest) -> OracleFuture<'a>;
}

/// Oracle backed by an external command.
///
/// The request is written to the command's stdin as JSON and the response is
/// read from its stdout. A non-zero exit status is an oracle error.
#[derive(Debug, Clone)]
pub struct ShellOracle {
    cmd: String,
    base_dir: PathBuf,
}

impl ShellOracle {
    pub fn new(cmd: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            cmd: cmd.into(),
            base_dir: base_dir.into(),
        }
    }
}

impl RemediationOracle for ShellOracle {
    fn remediate<'a>(&'a self, request: &'a RemediationRequest) -> OracleFuture<'a> {
        Box::pin(async move {
            let body = serde_json::to_vec(request).context("serializing remediation request")?;

            info!(
                unit = %request.unit_id,
                attempt = request.attempt,
                cmd = %self.cmd,
                "invoking remediation oracle"
            );

            let mut command = shell_command(&self.cmd);
            command
                .current_dir(&self.base_dir)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = command
                .spawn()
                .with_context(|| format!("spawning remediation oracle '{}'", self.cmd))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&body)
                    .await
                    .context("writing remediation request to oracle stdin")?;
                // Dropping stdin closes it so the oracle sees EOF.
            }

            let output = child
                .wait_with_output()
                .await
                .context("waiting for remediation oracle")?;

            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                debug!(unit = %request.unit_id, "oracle stderr: {}", stderr.trim());
            }

            if !output.status.success() {
                return Err(anyhow!(
                    "remediation oracle exited with status {}",
                    output.status.code().unwrap_or(-1)
                ));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            RemediationResponse::parse(stdout.trim())
                .with_context(|| format!("parsing remediation oracle response: {}", stdout.trim()))
        })
    }
}

/// Prompts keyed by the sorted set of failure categories, shared across all
/// pipelines.
///
/// A miss first looks for a tuned prompt at `<prompt_dir>/<key>.md`, then
/// synthesizes one from per-category instructions. Either way the result is
/// cached for the lifetime of the orchestrator.
#[derive(Debug, Clone)]
pub struct PromptCache {
    entries: Arc<Mutex<HashMap<String, Arc<str>>>>,
    prompt_dir: Option<PathBuf>,
    fs: Arc<dyn FileSystem>,
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PromptCache {
    pub fn new(prompt_dir: Option<PathBuf>) -> Self {
        Self::with_fs(prompt_dir, Arc::new(RealFileSystem))
    }

    pub fn with_fs(prompt_dir: Option<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            prompt_dir,
            fs,
        }
    }

    /// Cache key for a category set, e.g. `lint+type_check`.
    pub fn key(categories: &[FailureCategory]) -> String {
        let set: BTreeSet<FailureCategory> = categories.iter().copied().collect();
        set.iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Returns `(key, prompt)`.
    pub fn get_or_build(&self, categories: &[FailureCategory]) -> (String, Arc<str>) {
        let key = Self::key(categories);

        if let Some(hit) = self.lock().get(&key) {
            debug!(key = %key, "prompt cache hit");
            return (key, Arc::clone(hit));
        }

        let prompt: Arc<str> = self
            .load_tuned(&key)
            .unwrap_or_else(|| synthesize(categories))
            .into();

        // Another pipeline may have filled the slot meanwhile; keep the first.
        let prompt = Arc::clone(self.lock().entry(key.clone()).or_insert(prompt));
        (key, prompt)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<str>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_tuned(&self, key: &str) -> Option<String> {
        let path = self.prompt_dir.as_ref()?.join(format!("{key}.md"));
        if !self.fs.exists(&path) {
            return None;
        }
        match self.fs.read_to_string(&path) {
            Ok(text) => {
                debug!(path = %path.display(), "loaded tuned prompt");
                Some(text)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read tuned prompt; synthesizing");
                None
            }
        }
    }
}

fn synthesize(categories: &[FailureCategory]) -> String {
    let set: BTreeSet<FailureCategory> = categories.iter().copied().collect();
    let names: Vec<&str> = set.iter().map(|c| c.as_str()).collect();

    let mut prompt = format!(
        "The quality gate failed for this unit ({}). Fix the reported problems in place.\n",
        names.join(", ")
    );
    for category in &set {
        prompt.push_str("\n- ");
        prompt.push_str(instruction(*category));
    }
    prompt.push('\n');
    prompt
}

fn instruction(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::Lint => "Fix the lint violations without disabling or suppressing rules.",
        FailureCategory::TypeCheck => {
            "Resolve the type-check errors; keep public signatures unless they are the cause."
        }
        FailureCategory::Coverage => {
            "Add tests for the uncovered code paths until coverage meets the threshold."
        }
        FailureCategory::Format => "Apply the project's formatter to the affected files.",
        FailureCategory::Other => "Find the root cause of the remaining quality failures and fix it.",
    }
}
