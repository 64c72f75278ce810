//! Job execution under the safety gates.
//!
//! Live execution is opt-in twice over: `enable_live` for anything, and
//! `enable_destructive` on top for destructive entries. Dry runs never spawn
//! a process or touch the state file.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::core::types::{DispatchJob, ErrorKind, ExecMode, ExecutionResult, ExecutionStatus};
use crate::error::{EngineError, find_engine_error};
use crate::io::config::EngineConfig;
use crate::io::executor::{CommandRequest, CommandRunner};
use crate::io::state_store::WorkflowStateStore;
use crate::queue::{CancelToken, JobHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub live_enabled: bool,
    pub destructive_enabled: bool,
    pub allowlist: Vec<String>,
    pub protected_branches: Vec<String>,
    pub workdir: PathBuf,
    pub output_limit_bytes: usize,
}

impl DispatchPolicy {
    pub fn from_config(cfg: &EngineConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            live_enabled: cfg.safety.enable_live,
            destructive_enabled: cfg.safety.enable_destructive,
            allowlist: cfg.dispatch.allowlist.clone(),
            protected_branches: cfg.dispatch.protected_branches.clone(),
            workdir: workdir.into(),
            output_limit_bytes: cfg.dispatch.output_limit_bytes,
        }
    }
}

pub struct Dispatcher<R: CommandRunner> {
    policy: DispatchPolicy,
    runner: R,
    store: Arc<WorkflowStateStore>,
}

impl<R: CommandRunner> Dispatcher<R> {
    pub fn new(policy: DispatchPolicy, runner: R, store: Arc<WorkflowStateStore>) -> Self {
        Self {
            policy,
            runner,
            store,
        }
    }

    /// Safety gates for a job, in order: live flag, allowlist, destructive
    /// flag, branch guard. Dry runs only need a non-empty command.
    pub fn check_guards(&self, job: &DispatchJob) -> Result<(), EngineError> {
        let Some(executable) = job.resolved_command.first() else {
            return Err(EngineError::validation(format!(
                "job {} has an empty command",
                job.job_id
            )));
        };
        if job.mode == ExecMode::DryRun {
            return Ok(());
        }
        if !self.policy.live_enabled {
            return Err(EngineError::blocked(
                "live_allowed",
                "live execution is disabled (set safety.enable_live or ALLOW_WRITES=1)",
            ));
        }
        if !self.policy.allowlist.iter().any(|allowed| allowed == executable) {
            return Err(EngineError::blocked(
                "allowlist",
                format!("'{executable}' is not on the dispatch allowlist"),
            ));
        }
        if job.destructive && !self.policy.destructive_enabled {
            return Err(EngineError::blocked(
                "destructive",
                "destructive commands are disabled (set safety.enable_destructive or AR_ALLOW_DESTRUCTIVE=1)",
            ));
        }
        if job.mutates_state {
            match job.branch.as_deref() {
                None => {
                    return Err(EngineError::blocked(
                        "branch_not_protected",
                        "branch is unknown; refusing a state-mutating command",
                    ));
                }
                Some(branch) if self.policy.protected_branches.iter().any(|b| b == branch) => {
                    return Err(EngineError::blocked(
                        "branch_not_protected",
                        format!("branch '{branch}' is protected"),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// One attempt at a job. Never panics on command failure; every outcome is
    /// an [`ExecutionResult`].
    #[instrument(skip_all, fields(job_id = %job.job_id, mode = %job.mode))]
    pub fn execute(&self, job: &DispatchJob, cancel: &CancelToken) -> ExecutionResult {
        let started = Utc::now();
        let fail = |kind: ErrorKind, reason: String| {
            ExecutionResult::failed(job, started, Utc::now(), kind, reason)
        };

        if cancel.is_cancelled() {
            return fail(ErrorKind::Cancelled, "cancelled before start".to_string());
        }
        if let Err(err) = self.check_guards(job) {
            warn!(err = %err, "job refused");
            return fail(err.kind(), err.to_string());
        }
        if job.mode == ExecMode::DryRun {
            info!(command = %job.command_line(), "dry run: would execute");
            return ExecutionResult::success(job, started, Utc::now());
        }
        if let Err(err) = self.store.ensure_healthy() {
            error!(err = %format!("{err:#}"), "state store unusable, halting dispatch");
            let kind = find_engine_error(&err)
                .map(EngineError::kind)
                .unwrap_or(ErrorKind::StoreCorruption);
            return fail(kind, format!("{err:#}"));
        }
        if cancel.is_cancelled() {
            return fail(ErrorKind::Cancelled, "cancelled before spawn".to_string());
        }

        let request = CommandRequest {
            argv: job.resolved_command.clone(),
            workdir: self.policy.workdir.clone(),
            timeout: job.timeout(),
            output_limit_bytes: self.policy.output_limit_bytes,
        };
        match self.runner.run(&request) {
            Err(err) => fail(ErrorKind::ExecutionFailure, format!("{err:#}")),
            Ok(out) if out.timed_out => fail(
                ErrorKind::Timeout,
                format!("timed out after {}ms", job.timeout_ms),
            ),
            Ok(out) if out.success() => ExecutionResult::success(job, started, Utc::now()),
            Ok(out) => {
                let code = out
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let reason = match out.stderr_tail() {
                    Some(tail) => format!("exit {code}: {tail}"),
                    None => format!("exit {code}"),
                };
                fail(ErrorKind::ExecutionFailure, reason)
            }
        }
    }
}

impl<R: CommandRunner> JobHandler for Dispatcher<R> {
    fn attempt(&self, job: &DispatchJob, cancel: &CancelToken) -> ExecutionResult {
        self.execute(job, cancel)
    }

    /// Persist live outcomes. A success goes through `commit_execution` so
    /// its `emits` phase lands in the same write.
    fn finalize(&self, result: ExecutionResult) -> ExecutionResult {
        if result.job.mode == ExecMode::DryRun {
            return result;
        }
        if result.status != ExecutionStatus::Success {
            if let Err(err) = self.store.record_result(&result) {
                error!(err = %format!("{err:#}"), job_id = %result.job.job_id, "failed to record result");
            }
            return result;
        }
        match self.store.commit_execution(result.clone()) {
            Ok(committed) => committed,
            Err(err) => {
                error!(err = %format!("{err:#}"), job_id = %result.job.job_id, "failed to commit result");
                let mut failed = result;
                failed.status = ExecutionStatus::Failure;
                failed.error_kind = Some(ErrorKind::StoreCorruption);
                failed.error_reason = Some(format!("{err:#}"));
                failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::workflow::Phase;
    use crate::io::init::ArxPaths;
    use crate::io::observability::MemorySink;
    use crate::io::state_store::MemoryBackend;
    use crate::test_support::{ScriptedOutcome, ScriptedRunner, job};

    fn policy(live: bool) -> DispatchPolicy {
        DispatchPolicy {
            live_enabled: live,
            destructive_enabled: false,
            allowlist: vec!["cargo".to_string(), "git".to_string()],
            protected_branches: vec!["main".to_string(), "master".to_string()],
            workdir: PathBuf::from("."),
            output_limit_bytes: 1_000,
        }
    }

    fn memory_store() -> Arc<WorkflowStateStore> {
        Arc::new(WorkflowStateStore::new(
            Box::<MemoryBackend>::default(),
            Arc::new(MemorySink::default()),
        ))
    }

    fn dispatcher(
        policy: DispatchPolicy,
        outcomes: Vec<ScriptedOutcome>,
    ) -> (Dispatcher<Arc<ScriptedRunner>>, Arc<ScriptedRunner>, Arc<WorkflowStateStore>) {
        let runner = Arc::new(ScriptedRunner::new(outcomes));
        let store = memory_store();
        (
            Dispatcher::new(policy, Arc::clone(&runner), Arc::clone(&store)),
            runner,
            store,
        )
    }

    fn live_job() -> DispatchJob {
        job("F1", "T1", "S1")
    }

    fn dry_job() -> DispatchJob {
        DispatchJob {
            mode: ExecMode::DryRun,
            ..live_job()
        }
    }

    #[test]
    fn dry_run_never_spawns_or_persists() {
        let (dispatcher, runner, store) = dispatcher(policy(false), vec![]);
        let result = dispatcher.execute(&dry_job(), &CancelToken::default());
        assert_eq!(result.status, ExecutionStatus::Success);
        let result = dispatcher.finalize(result);
        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(runner.calls().is_empty());
        assert!(store.document().expect("doc").executions.is_empty());
    }

    #[test]
    fn live_requires_opt_in() {
        let (dispatcher, runner, _) = dispatcher(policy(false), vec![]);
        let result = dispatcher.execute(&live_job(), &CancelToken::default());
        assert_eq!(result.status, ExecutionStatus::Blocked);
        assert_eq!(result.error_kind, Some(ErrorKind::BlockedByGuard));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn allowlist_is_an_exact_match() {
        let (dispatcher, runner, _) = dispatcher(policy(true), vec![]);
        let job = DispatchJob {
            resolved_command: vec!["cargo-evil".to_string(), "run".to_string()],
            ..live_job()
        };
        let result = dispatcher.execute(&job, &CancelToken::default());
        assert_eq!(result.status, ExecutionStatus::Blocked);
        assert!(result.error_reason.unwrap_or_default().contains("allowlist"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn destructive_needs_its_own_flag() {
        let job = DispatchJob {
            destructive: true,
            ..live_job()
        };
        let (blocked, _, _) = dispatcher(policy(true), vec![]);
        assert_eq!(
            blocked.execute(&job, &CancelToken::default()).status,
            ExecutionStatus::Blocked
        );

        let enabled = DispatchPolicy {
            destructive_enabled: true,
            ..policy(true)
        };
        let (allowed, runner, _) = dispatcher(enabled, vec![ScriptedOutcome::Exit(0)]);
        assert_eq!(
            allowed.execute(&job, &CancelToken::default()).status,
            ExecutionStatus::Success
        );
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn branch_guard_blocks_protected_and_unknown_branches() {
        let (dispatcher, runner, _) = dispatcher(policy(true), vec![ScriptedOutcome::Exit(0)]);
        for branch in [Some("main".to_string()), None] {
            let job = DispatchJob {
                branch,
                ..live_job()
            };
            let result = dispatcher.execute(&job, &CancelToken::default());
            assert_eq!(result.status, ExecutionStatus::Blocked);
            assert!(
                result
                    .error_reason
                    .unwrap_or_default()
                    .contains("branch_not_protected")
            );
        }
        assert!(runner.calls().is_empty());

        let read_only = DispatchJob {
            branch: Some("main".to_string()),
            mutates_state: false,
            ..live_job()
        };
        let result = dispatcher.execute(&read_only, &CancelToken::default());
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    #[test]
    fn command_outcomes_map_to_error_kinds() {
        let (dispatcher, _, _) = dispatcher(
            policy(true),
            vec![
                ScriptedOutcome::Exit(2),
                ScriptedOutcome::TimedOut,
                ScriptedOutcome::SpawnError("no such file".to_string()),
            ],
        );
        let cancel = CancelToken::default();

        let failed = dispatcher.execute(&live_job(), &cancel);
        assert_eq!(failed.error_kind, Some(ErrorKind::ExecutionFailure));
        assert!(failed.is_retryable());
        assert!(failed.error_reason.as_deref().unwrap_or_default().starts_with("exit 2"));

        let timed_out = dispatcher.execute(&live_job(), &cancel);
        assert_eq!(timed_out.error_kind, Some(ErrorKind::Timeout));
        assert!(!timed_out.is_retryable());

        let spawn = dispatcher.execute(&live_job(), &cancel);
        assert_eq!(spawn.error_kind, Some(ErrorKind::ExecutionFailure));
    }

    #[test]
    fn cancelled_job_never_spawns() {
        let (dispatcher, runner, _) = dispatcher(policy(true), vec![]);
        let cancel = CancelToken::default();
        cancel.cancel();
        let result = dispatcher.execute(&live_job(), &cancel);
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn success_commits_emitted_phase() {
        let (dispatcher, _, store) = dispatcher(policy(true), vec![ScriptedOutcome::Exit(0)]);
        store.transition(Phase::Planning, None).expect("transition");
        let job = DispatchJob {
            emits: Some(Phase::Implementing),
            ..live_job()
        };
        let result = dispatcher.execute(&job, &CancelToken::default());
        let result = dispatcher.finalize(result);
        assert_eq!(result.status, ExecutionStatus::Success);
        let document = store.document().expect("doc");
        assert_eq!(document.state.current_state, Phase::Implementing);
        assert_eq!(document.executions.len(), 1);
    }

    #[test]
    fn blocked_results_are_recorded_without_transition() {
        let (dispatcher, _, store) = dispatcher(policy(false), vec![]);
        let job = DispatchJob {
            emits: Some(Phase::Planning),
            ..live_job()
        };
        let result = dispatcher.finalize(dispatcher.execute(&job, &CancelToken::default()));
        assert_eq!(result.status, ExecutionStatus::Blocked);
        let document = store.document().expect("doc");
        assert_eq!(document.state.current_state, Phase::Intake);
        assert_eq!(document.executions.len(), 1);
    }

    #[test]
    fn corrupt_store_halts_dispatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        fs::create_dir_all(&paths.state_dir).expect("mkdir");
        fs::write(&paths.state_path, "garbage").expect("write");
        fs::write(&paths.state_backup_path, "garbage").expect("write");
        let store = Arc::new(WorkflowStateStore::open(&paths, Arc::new(MemorySink::default())));
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let dispatcher = Dispatcher::new(policy(true), Arc::clone(&runner), store);

        let result = dispatcher.execute(&live_job(), &CancelToken::default());
        assert_eq!(result.error_kind, Some(ErrorKind::StoreCorruption));
        assert!(!result.is_retryable());
        assert!(runner.calls().is_empty());
    }
}
