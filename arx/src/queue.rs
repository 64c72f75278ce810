//! Bounded per-category worker pools with idempotent submission.
//!
//! Each category gets a fixed number of worker threads pulling from a FIFO
//! backlog. Submission claims `(mode, flow:task:step)` in a time-windowed
//! registry first; a second claim inside the window is answered with
//! `skipped_duplicate` without running anything.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{
    DispatchJob, ErrorKind, ExecMode, ExecutionResult, ExecutionStatus, IdempotencyKey,
};
use crate::error::EngineError;
use crate::io::config::{MAX_RETENTION_SECS, QueueConfig};
use crate::io::observability::{EngineEvent, ObservabilitySink};

/// Granularity of cancellable backoff sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Bounded exponential backoff for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base · 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Cooperative cancellation flag shared with a running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Longest claim window accepted; keeps `Instant` arithmetic in range.
pub const MAX_CLAIM_WINDOW: Duration = Duration::from_secs(MAX_RETENTION_SECS);

/// Idempotency claim: dry-run and live claims never collide.
pub type ClaimKey = (ExecMode, IdempotencyKey);

/// Time-windowed set of claimed idempotency keys, each stored with its expiry.
#[derive(Debug)]
pub struct IdempotencyRegistry {
    window: Duration,
    claims: Mutex<HashMap<ClaimKey, Instant>>,
}

impl IdempotencyRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.min(MAX_CLAIM_WINDOW),
            claims: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClaimKey, Instant>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically claim `key`. False if it is already held inside the window.
    pub fn try_claim(&self, key: &ClaimKey) -> bool {
        let now = Instant::now();
        let mut claims = self.lock();
        claims.retain(|_, expires_at| *expires_at > now);
        if claims.contains_key(key) {
            return false;
        }
        claims.insert(key.clone(), now + self.window);
        true
    }

    pub fn release(&self, key: &ClaimKey) {
        self.lock().remove(key);
    }

    /// Insert a claim made `age` ago (e.g. by an earlier process). It holds
    /// only for what is left of the window.
    pub fn seed(&self, key: ClaimKey, age: Duration) {
        let remaining = self.window.saturating_sub(age);
        if remaining.is_zero() {
            return;
        }
        let expires_at = Instant::now() + remaining;
        let mut claims = self.lock();
        let slot = claims.entry(key).or_insert(expires_at);
        *slot = (*slot).max(expires_at);
    }

    /// Time left on a live claim for `key`.
    pub fn remaining(&self, key: &ClaimKey) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .and_then(|expires_at| expires_at.checked_duration_since(now))
            .filter(|left| !left.is_zero())
    }
}

pub fn claim_key(job: &DispatchJob) -> ClaimKey {
    (job.mode, job.idempotency_key.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub pools: BTreeMap<String, usize>,
    pub retention: Duration,
    pub retry: RetryPolicy,
}

impl QueueSettings {
    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self {
            pools: cfg.pools.clone(),
            retention: Duration::from_secs(cfg.retention_secs),
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                base_delay: Duration::from_millis(cfg.base_delay_ms),
                max_delay: Duration::from_millis(cfg.max_delay_ms),
            },
        }
    }
}

/// What the workers do with a job.
pub trait JobHandler: Send + Sync {
    /// One execution attempt. Must honor `cancel` at its checkpoints.
    fn attempt(&self, job: &DispatchJob, cancel: &CancelToken) -> ExecutionResult;

    /// Called once per job with the final result (including duplicates and
    /// queued cancellations); may persist and adjust it.
    fn finalize(&self, result: ExecutionResult) -> ExecutionResult;
}

/// Handle for a submitted job's eventual result.
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: String,
    receiver: mpsc::Receiver<ExecutionResult>,
}

impl JobTicket {
    /// Block until the job finishes.
    pub fn wait(self) -> Result<ExecutionResult> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("job {} finished without a result", self.job_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the backlog before it started; its claim was released.
    Dequeued,
    /// Running; the cancel flag was raised.
    Signalled,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub category: String,
    pub workers: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub max_wait_ms: u64,
    pub last_wait_ms: u64,
}

struct QueuedJob {
    job: DispatchJob,
    claim_key: ClaimKey,
    enqueued_at: Instant,
    reply: mpsc::Sender<ExecutionResult>,
}

#[derive(Default)]
struct PoolState {
    backlog: VecDeque<QueuedJob>,
    running: HashMap<String, CancelToken>,
    shutdown: bool,
    completed: u64,
    max_wait: Duration,
    last_wait: Duration,
}

struct Pool {
    workers: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Pool {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Shared {
    pools: BTreeMap<String, Pool>,
    claims: IdempotencyRegistry,
    retry: RetryPolicy,
    handler: Arc<dyn JobHandler>,
    sink: Arc<dyn ObservabilitySink>,
}

impl Shared {
    /// Finalize a job that never reached a worker and hand back its result.
    fn settle(&self, result: ExecutionResult, reply: &mpsc::Sender<ExecutionResult>) {
        let result = self.handler.finalize(result);
        self.emit_finished(&result);
        // The submitter may have dropped its ticket.
        let _ = reply.send(result);
    }

    fn emit_finished(&self, result: &ExecutionResult) {
        self.sink.emit(&EngineEvent::DispatchFinished {
            job_id: result.job.job_id.clone(),
            candidate_id: result.job.candidate_id.clone(),
            category: result.job.category.clone(),
            status: result.status,
            latency_ms: result.latency_ms,
            attempts: result.attempts,
            error_kind: result.error_kind,
        });
    }

    fn emit_depth(&self, category: &str, depth: usize, running: usize) {
        self.sink.emit(&EngineEvent::QueueDepth {
            category: category.to_string(),
            depth,
            running,
        });
    }
}

pub struct DispatchQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatchQueue {
    /// Spawn every pool's workers.
    pub fn start(
        settings: &QueueSettings,
        handler: Arc<dyn JobHandler>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Result<Self> {
        if settings.pools.is_empty() {
            bail!("queue needs at least one worker pool");
        }
        let pools = settings
            .pools
            .iter()
            .map(|(name, &workers)| {
                let pool = Pool {
                    workers,
                    state: Mutex::new(PoolState::default()),
                    available: Condvar::new(),
                };
                (name.clone(), pool)
            })
            .collect();
        let shared = Arc::new(Shared {
            pools,
            claims: IdempotencyRegistry::new(settings.retention),
            retry: settings.retry,
            handler,
            sink,
        });

        let mut queue = Self {
            shared: Arc::clone(&shared),
            workers: Vec::new(),
        };
        for (name, pool) in &shared.pools {
            for idx in 0..pool.workers {
                let worker_shared = Arc::clone(&shared);
                let category = name.clone();
                let handle = thread::Builder::new()
                    .name(format!("arx-{name}-{idx}"))
                    .spawn(move || worker_loop(&worker_shared, &category))
                    .with_context(|| format!("spawn worker {name}-{idx}"))?;
                queue.workers.push(handle);
            }
        }
        debug!(workers = queue.workers.len(), "dispatch queue started");
        Ok(queue)
    }

    /// Seed claims from previously recorded live executions so a key that
    /// already ran in an earlier process stays suppressed for the window.
    pub fn preload_claims(&self, executions: &[ExecutionResult], now: DateTime<Utc>) {
        let mut seeded = 0usize;
        for result in executions {
            let ran = matches!(
                result.status,
                ExecutionStatus::Success | ExecutionStatus::Failure
            );
            if result.job.mode != ExecMode::Live || !ran {
                continue;
            }
            let age = (now - result.finished_at).to_std().unwrap_or(Duration::ZERO);
            self.shared.claims.seed(claim_key(&result.job), age);
            seeded += 1;
        }
        debug!(seeded, "preloaded idempotency claims");
    }

    /// Enqueue a job, or settle it immediately as a duplicate.
    #[instrument(skip_all, fields(job_id = %job.job_id, category = %job.category))]
    pub fn submit(&self, job: DispatchJob) -> Result<JobTicket> {
        let (category, pool) = self
            .shared
            .pools
            .get_key_value(&job.category)
            .ok_or_else(|| {
                EngineError::validation(format!("no worker pool for category '{}'", job.category))
            })?;
        let (reply, receiver) = mpsc::channel();
        let ticket = JobTicket {
            job_id: job.job_id.clone(),
            receiver,
        };
        let key = claim_key(&job);

        let mut state = pool.lock();
        if state.shutdown {
            bail!("dispatch queue is shutting down");
        }
        if !self.shared.claims.try_claim(&key) {
            drop(state);
            let shown = key.1.to_string();
            let expires_in_s = self.shared.claims.remaining(&key).map(|left| left.as_secs());
            info!(key = %shown, mode = %job.mode, ?expires_in_s, "duplicate submission suppressed");
            self.shared.sink.emit(&EngineEvent::DuplicateSuppressed {
                key: shown.clone(),
                mode: job.mode,
                candidate_id: job.candidate_id.clone(),
            });
            let now = Utc::now();
            let result = ExecutionResult::failed(
                &job,
                now,
                now,
                ErrorKind::DuplicateSuppressed,
                EngineError::DuplicateSuppressed { key: shown }.to_string(),
            );
            self.shared.settle(result, &reply);
            return Ok(ticket);
        }
        state.backlog.push_back(QueuedJob {
            job,
            claim_key: key,
            enqueued_at: Instant::now(),
            reply,
        });
        let (depth, running) = (state.backlog.len(), state.running.len());
        drop(state);
        pool.available.notify_one();

        debug!(depth, running, "job enqueued");
        self.shared.emit_depth(category, depth, running);
        Ok(ticket)
    }

    /// Cancel a queued or running job by id.
    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        for (name, pool) in &self.shared.pools {
            let mut state = pool.lock();
            if let Some(pos) = state.backlog.iter().position(|q| q.job.job_id == job_id)
                && let Some(queued) = state.backlog.remove(pos)
            {
                let (depth, running) = (state.backlog.len(), state.running.len());
                drop(state);
                self.shared.claims.release(&queued.claim_key);
                info!(job_id, "queued job cancelled");
                self.shared.emit_depth(name, depth, running);
                let now = Utc::now();
                let result = ExecutionResult::failed(
                    &queued.job,
                    now,
                    now,
                    ErrorKind::Cancelled,
                    "cancelled while queued",
                );
                self.shared.settle(result, &queued.reply);
                return CancelOutcome::Dequeued;
            }
            if let Some(token) = state.running.get(job_id) {
                token.cancel();
                info!(job_id, "running job signalled to cancel");
                return CancelOutcome::Signalled;
            }
        }
        CancelOutcome::NotFound
    }

    /// Backlog length for a category, or `None` if there is no such pool.
    pub fn depth(&self, category: &str) -> Option<usize> {
        self.shared
            .pools
            .get(category)
            .map(|pool| pool.lock().backlog.len())
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.shared
            .pools
            .iter()
            .map(|(name, pool)| {
                let state = pool.lock();
                PoolStats {
                    category: name.clone(),
                    workers: pool.workers,
                    queued: state.backlog.len(),
                    running: state.running.len(),
                    completed: state.completed,
                    max_wait_ms: state.max_wait.as_millis() as u64,
                    last_wait_ms: state.last_wait.as_millis() as u64,
                }
            })
            .collect()
    }

    /// Stop accepting work, let workers drain the backlog, and join them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for pool in self.shared.pools.values() {
            pool.lock().shutdown = true;
            pool.available.notify_all();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared, category: &str) {
    let Some(pool) = shared.pools.get(category) else {
        return;
    };
    loop {
        let next = {
            let mut state = pool.lock();
            loop {
                if let Some(queued) = state.backlog.pop_front() {
                    let waited = queued.enqueued_at.elapsed();
                    state.last_wait = waited;
                    state.max_wait = state.max_wait.max(waited);
                    let token = CancelToken::default();
                    state
                        .running
                        .insert(queued.job.job_id.clone(), token.clone());
                    break Some((queued, token, state.backlog.len(), state.running.len()));
                }
                if state.shutdown {
                    break None;
                }
                state = pool
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some((queued, token, depth, running)) = next else {
            debug!(category, "worker exiting");
            return;
        };
        shared.emit_depth(category, depth, running);

        let result = run_with_retries(shared, &queued.job, &token);
        let result = shared.handler.finalize(result);

        {
            let mut state = pool.lock();
            state.running.remove(&queued.job.job_id);
            state.completed += 1;
        }
        shared.emit_finished(&result);
        let _ = queued.reply.send(result);
    }
}

fn run_with_retries(shared: &Shared, job: &DispatchJob, cancel: &CancelToken) -> ExecutionResult {
    let max_attempts = shared.retry.max_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return cancelled(job, attempt - 1, "cancelled before attempt");
        }
        shared.sink.emit(&EngineEvent::DispatchStarted {
            job_id: job.job_id.clone(),
            candidate_id: job.candidate_id.clone(),
            category: job.category.clone(),
            mode: job.mode,
            attempt,
        });
        let mut result = shared.handler.attempt(job, cancel);
        result.attempts = attempt;
        if !result.is_retryable() || attempt >= max_attempts {
            return result;
        }

        let delay = shared.retry.delay_for(attempt);
        let reason = result.error_reason.clone().unwrap_or_default();
        warn!(job_id = %job.job_id, attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "retrying job");
        shared.sink.emit(&EngineEvent::DispatchRetry {
            job_id: job.job_id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            reason,
        });
        if !sleep_unless_cancelled(delay, cancel) {
            return cancelled(job, attempt, "cancelled during backoff");
        }
        attempt += 1;
    }
}

fn cancelled(job: &DispatchJob, attempts: u32, reason: &str) -> ExecutionResult {
    let now = Utc::now();
    let mut result = ExecutionResult::failed(job, now, now, ErrorKind::Cancelled, reason);
    result.attempts = attempts;
    result
}

/// False if cancelled before `total` elapsed.
fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
