//! Data model shared by every evaluation component.
//!
//! These types are the wire format for the on-disk artefacts described by the catalog and
//! pipeline modules (`meta.json`, `k_run_summary.json`, `messages.json`) as well as the
//! in-process handoff between the [`crate::pipeline`] state machine and its collaborators.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cooperative cancellation signal shared across a run's agent, tool dispatch, and verifier
/// stages. Deliberately built from `Arc<Notify>` + `AtomicBool` rather than
/// `tokio_util::CancellationToken` to match this crate's existing lock-free
/// `Arc<...>`-centric concurrency idiom instead of pulling in a new dependency for it.
#[derive(Clone, Default)]
pub struct Cancellation {
    notify: Arc<tokio::sync::Notify>,
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Cancellation {
            notify: Arc::new(tokio::sync::Notify::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called (immediately if it already has been).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// One of the externally hosted systems a task can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Notion,
    Github,
    Filesystem,
    Postgres,
    Browser,
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceName::Notion => "notion",
            ServiceName::Github => "github",
            ServiceName::Filesystem => "filesystem",
            ServiceName::Postgres => "postgres",
            ServiceName::Browser => "browser",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ServiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notion" => Ok(ServiceName::Notion),
            "github" => Ok(ServiceName::Github),
            "filesystem" => Ok(ServiceName::Filesystem),
            "postgres" => Ok(ServiceName::Postgres),
            "browser" => Ok(ServiceName::Browser),
            other => Err(format!("unknown service {other:?}")),
        }
    }
}

/// A task discovered in the on-disk catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub service: ServiceName,
    pub category: String,
    pub name: String,
    /// Directory this task was loaded from.
    pub root: PathBuf,
    /// Unrendered description template (may contain `{{PLACEHOLDER}}` tokens, §4.2.3). Rendered
    /// against a run's actual [`InitialStateInfo`] locators by the pipeline once state
    /// preparation has run, not at catalog-load time — a locator like a Notion page id is only
    /// known after `StateManager::set` returns, and is unique per run.
    pub description_template: String,
    pub meta: TaskMeta,
}

impl Task {
    /// Stable `service/category/name` identifier used in filters and artefact paths.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}/{}", self.service, self.category, self.name)
    }
}

/// `meta.json` contents. Unknown keys are preserved in `extra` so verifiers that rely on
/// task-specific metadata this crate doesn't know about keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    /// `meta.json`'s `category_id` is a JSON integer per §6.1; kept as `i64` rather than `String`
    /// so a spec-conformant catalog entry deserializes instead of being skipped as malformed.
    pub category_id: i64,
    pub category_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_timeout_seconds() -> u64 {
    600
}

/// Result of preparing a task's initial state, returned by [`crate::state_manager::StateManager::set`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialStateInfo {
    /// Named locators substituted into the task description template
    /// (e.g. `page_id`, `repo_url`, `test_directory`).
    pub locators: HashMap<String, String>,
    /// Opaque handle the same state manager needs back in `clean`/`retrieve`.
    pub state_handle: String,
}

/// Everything a single task/service/model/run-index combination needs to execute.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub task: Task,
    pub model: String,
    pub run_index: u32,
    pub k: u32,
    pub output_root: PathBuf,
}

impl RunContext {
    pub fn run_dir(&self) -> PathBuf {
        self.output_root
            .join(self.task.service.to_string())
            .join(&self.task.category)
            .join(&self.task.name)
            .join(&self.model)
            .join(format!("run-{}", self.run_index))
    }
}

/// Closed taxonomy of failures an orchestrator-level component can classify.
///
/// Kinds marked retryable are eligible for the pipeline's bounded-retry policy; the rest are
/// terminal and are reported as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// State preparation hit a transient upstream error (rate limit, 5xx, connection reset).
    StateTransient,
    /// State preparation failed in a way that will not resolve on retry (bad credentials,
    /// missing template, quota exhausted).
    StatePermanent,
    /// The target tool server could not be reached or crashed mid-run.
    ToolServerUnavailable,
    /// The model provider returned a transient error (rate limit, 5xx, timeout).
    ModelProviderTransient,
    /// The agent exhausted its turn, wall-clock, or token budget.
    BudgetExceeded,
    /// The verifier process itself failed to run (missing interpreter, crashed, timed out)
    /// as opposed to running and reporting a verification failure.
    VerifierInfra,
    /// An orchestrator-internal fault unrelated to any single run (config error, disk full).
    Orchestrator,
}

impl ErrorKind {
    /// Whether the pipeline should retry a run that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::StateTransient
                | ErrorKind::ToolServerUnavailable
                | ErrorKind::ModelProviderTransient
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::StateTransient => "state_transient",
            ErrorKind::StatePermanent => "state_permanent",
            ErrorKind::ToolServerUnavailable => "tool_server_unavailable",
            ErrorKind::ModelProviderTransient => "model_provider_transient",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::VerifierInfra => "verifier_infra",
            ErrorKind::Orchestrator => "orchestrator",
        };
        f.write_str(s)
    }
}

/// One entry in an [`AgentTrace`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub turn: u32,
    pub at: DateTime<Utc>,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEventKind {
    TurnStarted,
    ModelCallCompleted { response_chars: usize },
    ToolCallIssued { tool_name: String, parameters: serde_json::Value },
    ToolCallCompleted { tool_name: String, success: bool, error: Option<String> },
    TurnBudgetExceeded,
    WallClockBudgetExceeded,
    TokenBudgetExceeded,
    Terminal { reason: String },
}

/// Ordered record of everything the agent did during a run, persisted as `messages.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTrace {
    pub events: Vec<TraceEvent>,
}

impl AgentTrace {
    pub fn push(&mut self, turn: u32, kind: TraceEventKind) {
        self.events.push(TraceEvent {
            turn,
            at: Utc::now(),
            kind,
        });
    }
}

/// Outcome of the agent-execution phase of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub completed: bool,
    pub turns_used: u32,
    pub wall_clock: Duration,
    pub tokens_used: Option<u64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// Outcome of running the task's verifier against the post-execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub infra_failure: bool,
}

/// Final, persisted record of one `(task, model, run_index)` execution — the `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub run_id: Uuid,
    pub service: ServiceName,
    pub category: String,
    pub task_name: String,
    pub model: String,
    pub run_index: u32,
    pub attempts: u32,
    pub execution: ExecutionOutcome,
    pub verification: Option<VerificationOutcome>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TaskRunResult {
    /// A run is a "success" for metrics purposes iff execution completed and verification passed.
    pub fn succeeded(&self) -> bool {
        self.execution.completed
            && self
                .verification
                .as_ref()
                .map(|v| v.passed)
                .unwrap_or(false)
    }
}

/// Per-task aggregate metrics computed from a task's `k` run results — one value of
/// `detailed_task_metrics` in §6.6's `k_run_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskKMetrics {
    pub service: ServiceName,
    pub category: String,
    pub task_name: String,
    pub model: String,
    pub k: u32,
    pub successes: u32,
    #[serde(rename = "pass@1")]
    pub pass_at_1: f64,
    #[serde(rename = "pass@k")]
    pub pass_at_k: f64,
    #[serde(rename = "pass^k")]
    pub pass_hat_k: f64,
    #[serde(rename = "avg@k")]
    pub avg_at_k: f64,
    /// The `v ∈ {0,1}^k` success vector from §4.7, ordered by run index; a missing run is `false`.
    pub individual_results: Vec<bool>,
    /// Mean [`ExecutionOutcome::wall_clock`], in seconds, across runs that actually executed.
    pub avg_execution_time: f64,
    /// Mean [`ExecutionOutcome::tokens_used`] across runs that reported a token count.
    pub avg_token_usage: f64,
}

/// Metrics for one `(service, model)` group, aggregated across its tasks — one value of
/// `service_model_breakdown` in §6.6's `k_run_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKMetrics {
    pub service: ServiceName,
    pub model: String,
    pub total_tasks: usize,
    #[serde(rename = "pass@1")]
    pub pass_at_1: f64,
    #[serde(rename = "pass@k")]
    pub pass_at_k: f64,
    #[serde(rename = "pass^k")]
    pub pass_hat_k: f64,
    #[serde(rename = "avg@k")]
    pub avg_at_k: f64,
}

/// Overall metrics, the unweighted mean across every `(service, model)` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallMetrics {
    pub group_count: usize,
    #[serde(rename = "pass@1")]
    pub pass_at_1: f64,
    #[serde(rename = "pass@k")]
    pub pass_at_k: f64,
    #[serde(rename = "pass^k")]
    pub pass_hat_k: f64,
    #[serde(rename = "avg@k")]
    pub avg_at_k: f64,
}

/// Top-level `k_run_summary.json` contents (§6.6), keyed exactly the way the spec names it:
/// `service_model_breakdown` by `"<service>__<model>"`, `detailed_task_metrics` by
/// `"<service>__<model>/<category>/<task_name>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KRunSummary {
    pub experiment_name: String,
    pub k: u32,
    pub total_unique_tasks: usize,
    pub overall_metrics: OverallMetrics,
    pub service_model_breakdown: HashMap<String, GroupKMetrics>,
    pub detailed_task_metrics: HashMap<String, TaskKMetrics>,
}
