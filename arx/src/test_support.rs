//! Test-only builders and fakes.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::Value;

use crate::core::registry::{DEFAULT_CATEGORY, RegistryEntry};
use crate::core::types::{ActionType, Candidate, DispatchJob, ExecMode, IdempotencyKey};
use crate::io::executor::{CommandRequest, CommandRunner};
use crate::io::process::CapturedOutput;

/// Candidate with the given metrics; later duplicates overwrite earlier ones.
pub fn candidate(id: &str, action_type: ActionType, metrics: &[(&str, f64)]) -> Candidate {
    let mut map = BTreeMap::new();
    for (name, value) in metrics {
        map.insert(name.to_string(), Value::from(*value));
    }
    Candidate {
        id: id.to_string(),
        action_type,
        explanation: format!("{id} explanation"),
        preconditions: Vec::new(),
        metrics: map,
    }
}

/// Live `cargo test` job on a feature branch, keyed by `(flow, task, step)`.
pub fn job(flow: &str, task: &str, step: &str) -> DispatchJob {
    DispatchJob {
        job_id: format!("job-{flow}-{task}-{step}"),
        candidate_id: "run_tests".to_string(),
        resolved_command: vec!["cargo".to_string(), "test".to_string()],
        idempotency_key: IdempotencyKey::new(flow, task, step),
        mode: ExecMode::Live,
        category: DEFAULT_CATEGORY.to_string(),
        branch: Some("feature/x".to_string()),
        destructive: false,
        mutates_state: true,
        emits: None,
        decision_id: None,
        timeout_ms: 1_000,
        submitted_at: Utc::now(),
    }
}

/// Turn `root` into a git repository with `branch` checked out (unborn, no
/// commits).
pub fn git_checkout(root: &Path, branch: &str) {
    let head = format!("refs/heads/{branch}");
    for args in [vec!["init", "-q"], vec!["symbolic-ref", "HEAD", head.as_str()]] {
        let status = Command::new("git")
            .args(&args)
            .current_dir(root)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }
}

/// Minimal `cargo test` command entry with no requirements.
pub fn registry_entry(id: &str) -> RegistryEntry {
    RegistryEntry {
        id: id.to_string(),
        action_type: ActionType::CommandTrigger,
        command: vec!["cargo".to_string(), "test".to_string()],
        required_contexts: Vec::new(),
        required_states: Vec::new(),
        gates: Vec::new(),
        emits: None,
        category: DEFAULT_CATEGORY.to_string(),
        destructive: false,
        mutates_state: true,
        description: String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Exit(i32),
    TimedOut,
    SpawnError(String),
}

/// Runner that replays outcomes in order, then exits 0.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<Vec<ScriptedOutcome>>,
    calls: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new(outcomes: Vec<ScriptedOutcome>) -> Self {
        let mut outcomes = outcomes;
        outcomes.reverse();
        Self {
            outcomes: Mutex::new(outcomes),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &CommandRequest) -> Result<CapturedOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or(ScriptedOutcome::Exit(0));
        let (exit_code, timed_out, stderr) = match outcome {
            ScriptedOutcome::Exit(code) => {
                let stderr = if code == 0 {
                    String::new()
                } else {
                    format!("scripted failure {code}\n")
                };
                (Some(code), false, stderr)
            }
            ScriptedOutcome::TimedOut => (None, true, String::new()),
            ScriptedOutcome::SpawnError(reason) => {
                return Err(anyhow!("spawn {}: {reason}", request.argv.join(" ")));
            }
        };
        Ok(CapturedOutput {
            exit_code,
            stdout: String::new(),
            stderr,
            truncated_bytes: 0,
            timed_out,
            elapsed: Duration::from_millis(1),
        })
    }
}
