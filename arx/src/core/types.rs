//! Shared deterministic types for the engine.
//!
//! These types define stable contracts between components and are serialized
//! into the decision log, the state file, and observability events. Field
//! names are append-only: new fields get serde defaults, existing ones never
//! change meaning.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::workflow::Phase;

/// Kind of action a candidate proposes.
///
/// `CommandTrigger` candidates carry side effects once dispatched; exploration
/// and scoring treat them more conservatively than advisory steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    NaturalStep,
    CommandTrigger,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::NaturalStep => write!(f, "NATURAL_STEP"),
            ActionType::CommandTrigger => write!(f, "COMMAND_TRIGGER"),
        }
    }
}

/// A proposed next action submitted by an external candidate source.
///
/// Metrics stay as raw JSON values so the scorer can exclude non-numeric
/// entries with a reason instead of coercing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
}

/// Candidate with its scoring breakdown. Recomputed every round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub base_score: f64,
    pub command_bias_penalty: f64,
    pub calibrated_score: f64,
    pub final_score: f64,
}

impl ScoredCandidate {
    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    pub fn action_type(&self) -> ActionType {
        self.candidate.action_type
    }
}

/// A candidate the scorer refused, with the reason recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub candidate_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    NextStep,
    OptionSet,
    AskClarify,
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionType::NextStep => write!(f, "NEXT_STEP"),
            DecisionType::OptionSet => write!(f, "OPTION_SET"),
            DecisionType::AskClarify => write!(f, "ASK_CLARIFY"),
        }
    }
}

/// Non-acting evaluation of an alternative threshold set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowReport {
    pub decision_type: DecisionType,
    pub selected: Vec<String>,
    pub diverged: bool,
}

/// Gate output for one round. Immutable once appended to the decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub decision_type: DecisionType,
    /// Set for `NEXT_STEP` only.
    #[serde(default)]
    pub chosen_id: Option<String>,
    /// Set for `OPTION_SET` only, in ranking order.
    #[serde(default)]
    pub option_set: Vec<String>,
    pub confidence: f64,
    pub gap: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub calibration_version: Option<String>,
    /// Top candidate that exploration replaced, if any.
    #[serde(default)]
    pub explored_from: Option<String>,
    #[serde(default)]
    pub shadow: Option<ShadowReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    DryRun,
    Live,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::DryRun => write!(f, "dry_run"),
            ExecMode::Live => write!(f, "live"),
        }
    }
}

/// `(flow, task, step)` tuple guaranteeing at most one live execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub flow_id: String,
    pub task_id: String,
    pub step_id: String,
}

impl IdempotencyKey {
    pub fn new(
        flow_id: impl Into<String>,
        task_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            task_id: task_id.into(),
            step_id: step_id.into(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.flow_id, self.task_id, self.step_id)
    }
}

/// A resolved command queued for execution. Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub job_id: String,
    pub candidate_id: String,
    pub resolved_command: Vec<String>,
    pub idempotency_key: IdempotencyKey,
    pub mode: ExecMode,
    /// Worker pool that runs the job.
    pub category: String,
    /// Branch the workflow is associated with, if known.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default = "default_true")]
    pub mutates_state: bool,
    /// Phase to enter when the job succeeds.
    #[serde(default)]
    pub emits: Option<Phase>,
    #[serde(default)]
    pub decision_id: Option<String>,
    pub timeout_ms: u64,
    pub submitted_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl DispatchJob {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Shell-like rendering for logs only; never executed through a shell.
    pub fn command_line(&self) -> String {
        self.resolved_command.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    SkippedDuplicate,
    Blocked,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::SkippedDuplicate => "skipped_duplicate",
            ExecutionStatus::Blocked => "blocked",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Persisted classification of a failed or refused execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidTransition,
    BlockedByGuard,
    DuplicateSuppressed,
    ExecutionFailure,
    Timeout,
    Cancelled,
    StoreCorruption,
}

impl ErrorKind {
    /// Only transient execution failures are retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ExecutionFailure)
    }
}

/// Outcome of one dispatched job. Append-only once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job: DispatchJob,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub latency_ms: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl ExecutionResult {
    pub fn success(job: &DispatchJob, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        Self::build(job, started_at, finished_at, ExecutionStatus::Success, None, None)
    }

    /// Failure or refusal; the status follows from the error kind.
    pub fn failed(
        job: &DispatchJob,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        let status = match kind {
            ErrorKind::BlockedByGuard => ExecutionStatus::Blocked,
            ErrorKind::DuplicateSuppressed => ExecutionStatus::SkippedDuplicate,
            ErrorKind::Cancelled => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failure,
        };
        Self::build(
            job,
            started_at,
            finished_at,
            status,
            Some(kind),
            Some(reason.into()),
        )
    }

    fn build(
        job: &DispatchJob,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: ExecutionStatus,
        error_kind: Option<ErrorKind>,
        error_reason: Option<String>,
    ) -> Self {
        let latency_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            job: job.clone(),
            started_at,
            finished_at,
            status,
            latency_ms,
            attempts: 0,
            error_kind,
            error_reason,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status == ExecutionStatus::Failure
            && self.error_kind.is_some_and(ErrorKind::is_retryable)
    }
}

/// Validate an identifier: non-empty, ASCII only, no whitespace or control
/// characters.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if !id.is_ascii() {
        return Err(format!("id '{}' contains non-ASCII characters", id.escape_default()));
    }
    if id.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
        return Err(format!("id '{}' contains whitespace", id.escape_default()));
    }
    Ok(())
}
