//! Durable workflow state (`.arx/state/workflow.json`).
//!
//! The state document holds the workflow phase, its history, and the append-only
//! execution ledger, so a phase change and the result that caused it land in
//! one atomic write. Every read-modify-write holds the in-process mutex and,
//! for file-backed stores, an advisory lock on `workflow.lock`, so concurrent
//! engine processes cannot interleave updates.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::core::types::{ErrorKind, ExecutionResult, ExecutionStatus};
use crate::core::workflow::{Phase, TransitionOutcome, WorkflowState};
use crate::error::EngineError;
use crate::io::fsutil::{LockFile, write_atomic};
use crate::io::init::ArxPaths;
use crate::io::observability::{EngineEvent, ObservabilitySink};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(flatten)]
    pub state: WorkflowState,
    #[serde(default)]
    pub executions: Vec<ExecutionResult>,
    #[serde(default)]
    pub recoveries: Vec<RecoveryEvent>,
}

/// Record of a load that fell back to the backup copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub reason: String,
}

/// Result of a backend load.
#[derive(Debug)]
pub struct Loaded {
    /// `None` when nothing has been written yet.
    pub document: Option<StateDocument>,
    /// Set when the primary copy was unusable and the backup was returned.
    pub recovery: Option<String>,
}

/// Storage for the state document.
pub trait StateBackend: Send + Sync {
    fn load(&self) -> Result<Loaded>;
    fn store(&self, document: &StateDocument) -> Result<()>;
    /// Human-readable location for logs.
    fn describe(&self) -> String;
    /// Cross-process exclusion for one read-modify-write, if the backend is
    /// shared between processes.
    fn lock(&self) -> Result<Option<LockFile>> {
        Ok(None)
    }
}

/// JSON file with a last-known-good backup next to it, guarded by a sibling
/// `.lock` file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    primary: PathBuf,
    backup: PathBuf,
    lock: PathBuf,
}

impl FileBackend {
    pub fn new(primary: impl Into<PathBuf>, backup: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        Self {
            lock: primary.with_extension("lock"),
            backup: backup.into(),
            primary,
        }
    }
}

impl StateBackend for FileBackend {
    fn load(&self) -> Result<Loaded> {
        let primary_problem = match read_document(&self.primary) {
            Ok(Some(document)) => {
                return Ok(Loaded {
                    document: Some(document),
                    recovery: None,
                });
            }
            Ok(None) if !self.backup.exists() => {
                return Ok(Loaded {
                    document: None,
                    recovery: None,
                });
            }
            Ok(None) => "primary state file is missing".to_string(),
            Err(reason) => reason,
        };

        warn!(path = %self.primary.display(), reason = %primary_problem, "primary state unusable, trying backup");
        match read_document(&self.backup) {
            Ok(Some(document)) => Ok(Loaded {
                document: Some(document),
                recovery: Some(primary_problem),
            }),
            Ok(None) => Err(corruption(&self.primary, &primary_problem, "backup is missing")),
            Err(backup_problem) => Err(corruption(&self.primary, &primary_problem, &backup_problem)),
        }
    }

    fn store(&self, document: &StateDocument) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(document).context("serialize workflow state")?;
        buf.push('\n');
        write_atomic(&self.primary, &buf)?;
        write_atomic(&self.backup, &buf)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.primary.display().to_string()
    }

    fn lock(&self) -> Result<Option<LockFile>> {
        LockFile::acquire(&self.lock).map(Some)
    }
}

fn corruption(path: &Path, primary: &str, backup: &str) -> anyhow::Error {
    EngineError::StoreCorruption {
        path: path.display().to_string(),
        reason: format!("{primary}; backup: {backup}"),
    }
    .into()
}

/// `Ok(None)` if the file does not exist; `Err(reason)` if it is unusable.
fn read_document(path: &Path) -> std::result::Result<Option<StateDocument>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("read {}: {err}", path.display())),
    };
    let document: StateDocument = serde_json::from_str(&contents)
        .map_err(|err| format!("parse {}: {err}", path.display()))?;
    let violations = document.state.check_invariants();
    if !violations.is_empty() {
        return Err(format!(
            "{} violates invariants: {}",
            path.display(),
            violations.join("; ")
        ));
    }
    Ok(Some(document))
}

/// In-process backend for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    document: Mutex<Option<StateDocument>>,
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<Loaded> {
        let document = self
            .document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(Loaded {
            document,
            recovery: None,
        })
    }

    fn store(&self, document: &StateDocument) -> Result<()> {
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = Some(document.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Both locks held for one read-modify-write. Fields drop in order, so the
/// file lock is released before the mutex.
struct WriteGuard<'a> {
    _file: Option<LockFile>,
    _local: MutexGuard<'a, ()>,
}

/// Single-writer front for a [`StateBackend`].
pub struct WorkflowStateStore {
    backend: Box<dyn StateBackend>,
    write_lock: Mutex<()>,
    sink: Arc<dyn ObservabilitySink>,
    /// Ledger entries older than this are dropped on the next write.
    ledger_retention: Option<Duration>,
}

impl WorkflowStateStore {
    pub fn new(backend: Box<dyn StateBackend>, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
            sink,
            ledger_retention: None,
        }
    }

    /// Prune execution results that finished more than `retention` ago
    /// whenever a result is appended.
    pub fn with_ledger_retention(mut self, retention: Duration) -> Self {
        self.ledger_retention = Some(retention);
        self
    }

    /// File-backed store at the workspace's canonical paths.
    pub fn open(paths: &ArxPaths, sink: Arc<dyn ObservabilitySink>) -> Self {
        let backend = FileBackend::new(&paths.state_path, &paths.state_backup_path);
        Self::new(Box::new(backend), sink)
    }

    pub fn read(&self) -> Result<WorkflowState> {
        Ok(self.document()?.state)
    }

    /// Full document, recovering from backup if needed.
    pub fn document(&self) -> Result<StateDocument> {
        let _guard = self.lock()?;
        self.load_or_recover()
    }

    /// Fails with `StoreCorruption` if neither copy is usable.
    pub fn ensure_healthy(&self) -> Result<()> {
        self.document().map(|_| ())
    }

    #[instrument(skip_all, fields(to = %to))]
    pub fn transition(&self, to: Phase, decision_id: Option<&str>) -> Result<TransitionOutcome> {
        let _guard = self.lock()?;
        let mut document = self.load_or_recover()?;
        let outcome = document.state.apply_transition(to, decision_id, Utc::now())?;
        if let TransitionOutcome::Applied(entry) = &outcome {
            self.backend.store(&document)?;
            debug!(from = %entry.from, to = %entry.to, "transition applied");
        }
        Ok(outcome)
    }

    /// Append a successful result and apply the job's `emits` phase in one
    /// write. An invalid emitted transition downgrades the result to a failure.
    #[instrument(skip_all, fields(job_id = %result.job.job_id))]
    pub fn commit_execution(&self, mut result: ExecutionResult) -> Result<ExecutionResult> {
        let _guard = self.lock()?;
        let mut document = self.load_or_recover()?;
        if result.status == ExecutionStatus::Success
            && let Some(to) = result.job.emits
        {
            let decision_id = result.job.decision_id.clone();
            if let Err(err) =
                document
                    .state
                    .apply_transition(to, decision_id.as_deref(), result.finished_at)
            {
                warn!(err = %err, "emitted transition rejected");
                result.status = ExecutionStatus::Failure;
                result.error_kind = Some(ErrorKind::InvalidTransition);
                result.error_reason = Some(err.to_string());
            }
        }
        self.prune_ledger(&mut document);
        document.executions.push(result.clone());
        self.backend.store(&document)?;
        Ok(result)
    }

    /// Append a result without touching the workflow phase.
    pub fn record_result(&self, result: &ExecutionResult) -> Result<()> {
        let _guard = self.lock()?;
        let mut document = self.load_or_recover()?;
        self.prune_ledger(&mut document);
        document.executions.push(result.clone());
        self.backend.store(&document)
    }

    fn prune_ledger(&self, document: &mut StateDocument) {
        let Some(retention) = self.ledger_retention else {
            return;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        let before = document.executions.len();
        document.executions.retain(|result| result.finished_at >= cutoff);
        let pruned = before - document.executions.len();
        if pruned > 0 {
            debug!(pruned, "expired ledger entries dropped");
        }
    }

    fn lock(&self) -> Result<WriteGuard<'_>> {
        let local = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("workflow state lock poisoned"))?;
        let file = self.backend.lock().context("lock workflow state")?;
        Ok(WriteGuard {
            _file: file,
            _local: local,
        })
    }

    /// Caller must hold the write lock.
    fn load_or_recover(&self) -> Result<StateDocument> {
        let loaded = self.backend.load()?;
        let mut document = loaded.document.unwrap_or_default();
        if let Some(reason) = loaded.recovery {
            let source = self.backend.describe();
            error!(source = %source, reason = %reason, "workflow state restored from backup");
            self.sink.emit(&EngineEvent::RecoveryPerformed {
                path: source.clone(),
                reason: reason.clone(),
            });
            document.recoveries.push(RecoveryEvent {
                timestamp: Utc::now(),
                source,
                reason,
            });
            self.backend
                .store(&document)
                .context("rewrite recovered workflow state")?;
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::error::find_engine_error;
    use crate::io::observability::MemorySink;
    use crate::test_support::job;

    fn file_store(paths: &ArxPaths) -> (WorkflowStateStore, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (WorkflowStateStore::open(paths, sink.clone()), sink)
    }

    fn success(emits: Option<Phase>) -> ExecutionResult {
        let mut job = job("F1", "T1", "S1");
        job.emits = emits;
        let now = Utc::now();
        ExecutionResult::success(&job, now, now)
    }

    #[test]
    fn fresh_store_starts_at_intake() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (store, _) = file_store(&ArxPaths::new(temp.path()));
        let state = store.read().expect("read");
        assert_eq!(state, WorkflowState::default());
    }

    #[test]
    fn transitions_persist_across_instances() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let (store, _) = file_store(&paths);
        store.transition(Phase::Planning, Some("dec-1")).expect("transition");
        store.transition(Phase::Planning, None).expect("no-op");

        let (reopened, _) = file_store(&paths);
        let state = reopened.read().expect("read");
        assert_eq!(state.current_state, Phase::Planning);
        assert_eq!(state.history.len(), 1);
        assert!(paths.state_backup_path.is_file());
    }

    #[test]
    fn invalid_transition_leaves_file_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let (store, _) = file_store(&paths);
        store.transition(Phase::Planning, None).expect("transition");
        let before = fs::read_to_string(&paths.state_path).expect("read");

        let err = store.transition(Phase::Done, None).unwrap_err();
        assert!(matches!(
            find_engine_error(&err),
            Some(EngineError::InvalidTransition { .. })
        ));
        assert_eq!(fs::read_to_string(&paths.state_path).expect("read"), before);
    }

    #[test]
    fn torn_temp_file_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let (store, _) = file_store(&paths);
        store.transition(Phase::Planning, None).expect("transition");

        let tmp = paths.state_dir.join("workflow.json.tmp");
        fs::write(&tmp, "{\"current_state\": \"impl").expect("write torn tmp");

        let state = store.read().expect("read");
        assert_eq!(state.current_state, Phase::Planning);
    }

    #[test]
    fn corrupt_primary_recovers_from_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let (store, sink) = file_store(&paths);
        store.transition(Phase::Planning, None).expect("transition");
        fs::write(&paths.state_path, "{ not json").expect("corrupt");

        let document = store.document().expect("recover");
        assert_eq!(document.state.current_state, Phase::Planning);
        assert_eq!(document.recoveries.len(), 1);
        assert!(matches!(
            sink.events().as_slice(),
            [EngineEvent::RecoveryPerformed { .. }]
        ));

        // Primary was rewritten, so the next read needs no recovery.
        let again = store.document().expect("read");
        assert_eq!(again.recoveries.len(), 1);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn tampered_primary_recovers_from_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let (store, _) = file_store(&paths);
        store.transition(Phase::Planning, None).expect("transition");
        let tampered = fs::read_to_string(&paths.state_path)
            .expect("read")
            .replace("\"current_state\": \"planning\"", "\"current_state\": \"done\"");
        fs::write(&paths.state_path, tampered).expect("write");

        let state = store.read().expect("recover");
        assert_eq!(state.current_state, Phase::Planning);
    }

    #[test]
    fn both_copies_corrupt_is_store_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let (store, _) = file_store(&paths);
        store.transition(Phase::Planning, None).expect("transition");
        fs::write(&paths.state_path, "garbage").expect("corrupt");
        fs::write(&paths.state_backup_path, "garbage").expect("corrupt");

        let err = store.ensure_healthy().unwrap_err();
        assert!(matches!(
            find_engine_error(&err),
            Some(EngineError::StoreCorruption { .. })
        ));
        assert!(store.transition(Phase::Implementing, None).is_err());
    }

    #[test]
    fn commit_applies_emits_with_result() {
        let store = WorkflowStateStore::new(
            Box::<MemoryBackend>::default(),
            Arc::new(MemorySink::default()),
        );
        store.transition(Phase::Planning, None).expect("transition");

        let committed = store
            .commit_execution(success(Some(Phase::Implementing)))
            .expect("commit");
        assert_eq!(committed.status, ExecutionStatus::Success);
        let document = store.document().expect("document");
        assert_eq!(document.state.current_state, Phase::Implementing);
        assert_eq!(document.executions.len(), 1);
    }

    #[test]
    fn invalid_emits_downgrades_result() {
        let store = WorkflowStateStore::new(
            Box::<MemoryBackend>::default(),
            Arc::new(MemorySink::default()),
        );
        let committed = store
            .commit_execution(success(Some(Phase::Releasing)))
            .expect("commit");
        assert_eq!(committed.status, ExecutionStatus::Failure);
        assert_eq!(committed.error_kind, Some(ErrorKind::InvalidTransition));
        let document = store.document().expect("document");
        assert_eq!(document.state.current_state, Phase::Intake);
        assert_eq!(document.executions, vec![committed]);
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let (store, _) = file_store(&paths);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.record_result(&success(None)).expect("record"))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(store.document().expect("document").executions.len(), 8);
    }

    #[test]
    fn separate_store_instances_serialize_through_the_lock_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let stores: Vec<Arc<WorkflowStateStore>> =
            (0..2).map(|_| Arc::new(file_store(&paths).0)).collect();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&stores[i % 2]);
                thread::spawn(move || store.record_result(&success(None)).expect("record"))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(stores[0].document().expect("document").executions.len(), 8);
        assert!(paths.state_dir.join("workflow.lock").is_file());
    }

    #[test]
    fn appends_prune_results_outside_the_retention_window() {
        let store = WorkflowStateStore::new(
            Box::<MemoryBackend>::default(),
            Arc::new(MemorySink::default()),
        )
        .with_ledger_retention(Duration::from_secs(60 * 60));
        let stale_at = Utc::now() - chrono::Duration::hours(2);
        let mut stale = success(None);
        stale.started_at = stale_at;
        stale.finished_at = stale_at;
        store.record_result(&stale).expect("stale");
        store.record_result(&success(None)).expect("fresh");
        store.commit_execution(success(None)).expect("commit");

        let document = store.document().expect("document");
        assert_eq!(document.executions.len(), 2);
        assert!(document.executions.iter().all(|r| r.finished_at > stale_at));
    }
}
