//! Orchestration for one decision round: score, gate, resolve, dispatch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::gate::build_decision;
use crate::core::registry::{GateContext, Registry, ResolveContext, ResolvedCommand};
use crate::core::scorer::{ScoreReport, ScoringParams, score_candidates};
use crate::core::types::{
    ActionType, Candidate, Decision, DecisionType, DispatchJob, ExecMode, ExecutionResult,
    Exclusion, IdempotencyKey, validate_id,
};
use crate::core::workflow::Phase;
use crate::error::EngineError;
use crate::io::config::{EngineConfig, load_config};
use crate::io::decision_log::append_decision;
use crate::io::dispatcher::{DispatchPolicy, Dispatcher};
use crate::io::executor::CommandRunner;
use crate::io::fsutil::LockFile;
use crate::io::git::GitProbe;
use crate::io::init::ArxPaths;
use crate::io::observability::{EngineEvent, ObservabilitySink, sink_for};
use crate::io::registry_store::load_registry;
use crate::io::state_store::WorkflowStateStore;
use crate::queue::{DispatchQueue, JobHandler, QueueSettings};

/// Env vars whose presence marks a CI run.
const CI_ENV_VARS: [&str; 3] = ["CI", "GITHUB_ACTIONS", "GITLAB_CI"];

/// Paths ignored when deciding whether the worktree is clean.
const ENGINE_OWNED_PREFIXES: [&str; 1] = [".arx"];

/// Inputs for one `decide` round.
#[derive(Debug, Clone)]
pub struct DecideRequest {
    pub candidates: Vec<Candidate>,
    pub mode: ExecMode,
    pub flow_id: String,
    pub task_id: String,
    pub step_id: String,
    /// Values for `{{name}}` placeholders.
    pub context: BTreeMap<String, String>,
    /// Branch the caller expects to be on. Git is still asked; this can only
    /// make the branch guard stricter.
    pub branch_override: Option<String>,
}

/// Everything a round produced, for the caller to print.
#[derive(Debug, Clone, Serialize)]
pub struct DecideOutcome {
    pub phase: Phase,
    pub score: ScoreReport,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<ExecutionResult>,
}

/// Score candidates with the workspace config. Touches no state.
pub fn score_only(root: &Path, candidates: &[Candidate]) -> Result<ScoreReport> {
    let paths = ArxPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    Ok(score_candidates(candidates, &scoring_params(&cfg)))
}

/// Run one full round against the workspace at `root`.
///
/// Only a `NEXT_STEP` on a `COMMAND_TRIGGER` reaches the dispatcher; every
/// other decision is logged and returned as is.
#[instrument(skip_all, fields(mode = %request.mode, flow = %request.flow_id, task = %request.task_id, step = %request.step_id))]
pub fn decide_and_dispatch<R>(root: &Path, request: &DecideRequest, runner: R) -> Result<DecideOutcome>
where
    R: CommandRunner + 'static,
{
    validate_request(request)?;
    let paths = ArxPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    let sink = sink_for(&paths, &cfg.safety)?;
    let store = Arc::new(
        WorkflowStateStore::open(&paths, Arc::clone(&sink))
            .with_ledger_retention(Duration::from_secs(cfg.queue.retention_secs)),
    );
    let phase = store.read().context("read workflow state")?.current_state;
    let registry = load_registry(&paths.registry_path)?;

    let (admissible, mut inadmissible) = filter_admissible(&request.candidates, &registry, phase);
    let mut score = score_candidates(&admissible, &scoring_params(&cfg));
    inadmissible.append(&mut score.excluded);
    score.excluded = inadmissible;
    for exclusion in &score.excluded {
        debug!(candidate = %exclusion.candidate_id, reason = %exclusion.reason, "candidate excluded");
        sink.emit(&EngineEvent::CandidateExcluded {
            candidate_id: exclusion.candidate_id.clone(),
            reason: exclusion.reason.clone(),
        });
    }

    let mut rng = match cfg.gate.exploration.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let decision = build_decision(&score, &cfg.gate, &mut rng, Utc::now());
    append_decision(&paths.decisions_path, &decision)?;
    report_decision(sink.as_ref(), &decision);

    let mut outcome = DecideOutcome {
        phase,
        score,
        decision,
        resolved: None,
        dispatch: None,
    };
    let Some(chosen) = command_to_run(&outcome) else {
        info!(decision = %outcome.decision.decision_type, "nothing to dispatch");
        return Ok(outcome);
    };

    let gates = gate_context(root, &cfg, request);
    let resolved = registry.resolve(
        &chosen,
        &ResolveContext {
            params: &request.context,
            state: phase,
            gates: &gates,
        },
    )?;
    let job = build_job(&cfg, request, &outcome.decision, &resolved, gates.branch.clone());
    outcome.resolved = Some(resolved);

    let dispatcher = Dispatcher::new(
        DispatchPolicy::from_config(&cfg, root),
        runner,
        Arc::clone(&store),
    );
    let handler: Arc<dyn JobHandler> = Arc::new(dispatcher);
    // Another process may be mid-round on the same key; its result must be in
    // the ledger before we preload.
    let _round = match request.mode {
        ExecMode::Live => Some(LockFile::acquire(&paths.dispatch_lock_path)?),
        ExecMode::DryRun => None,
    };
    let queue = DispatchQueue::start(&QueueSettings::from_config(&cfg.queue), handler, sink)?;
    queue.preload_claims(&store.document()?.executions, Utc::now());
    let ticket = queue.submit(job)?;
    let result = ticket.wait();
    queue.shutdown();
    let result = result?;
    info!(status = %result.status, attempts = result.attempts, "dispatch finished");
    outcome.dispatch = Some(result);
    Ok(outcome)
}

fn validate_request(request: &DecideRequest) -> Result<(), EngineError> {
    for (field, value) in [
        ("flow", &request.flow_id),
        ("task", &request.task_id),
        ("step", &request.step_id),
    ] {
        validate_id(value).map_err(|reason| EngineError::validation(format!("{field}: {reason}")))?;
    }
    Ok(())
}

fn scoring_params(cfg: &EngineConfig) -> ScoringParams<'_> {
    ScoringParams {
        weights: cfg.scoring.weights,
        command_bias: cfg.scoring.command_bias,
        calibration: cfg.scoring.active_calibration(),
    }
}

/// Drop command candidates whose registry entry is not admissible in `phase`.
fn filter_admissible(
    candidates: &[Candidate],
    registry: &Registry,
    phase: Phase,
) -> (Vec<Candidate>, Vec<Exclusion>) {
    let mut admissible = Vec::with_capacity(candidates.len());
    let mut excluded = Vec::new();
    for candidate in candidates {
        let entry = registry.get(&candidate.id);
        match entry {
            Some(entry)
                if candidate.action_type == ActionType::CommandTrigger
                    && !entry.admissible_in(phase) =>
            {
                excluded.push(Exclusion {
                    candidate_id: candidate.id.clone(),
                    reason: format!("not admissible in state '{phase}'"),
                });
            }
            _ => admissible.push(candidate.clone()),
        }
    }
    (admissible, excluded)
}

fn report_decision(sink: &dyn ObservabilitySink, decision: &Decision) {
    sink.emit(&EngineEvent::DecisionMade {
        decision_id: decision.decision_id.clone(),
        decision_type: decision.decision_type,
        chosen_id: decision.chosen_id.clone(),
        option_count: decision.option_set.len(),
        confidence: decision.confidence,
        gap: decision.gap,
        explored_from: decision.explored_from.clone(),
    });
    if let Some(shadow) = &decision.shadow
        && shadow.diverged
    {
        warn!(
            decision_id = %decision.decision_id,
            live = %decision.decision_type,
            shadow = %shadow.decision_type,
            "shadow thresholds diverge from live decision"
        );
        sink.emit(&EngineEvent::ShadowDivergence {
            decision_id: decision.decision_id.clone(),
            live_type: decision.decision_type,
            shadow_type: shadow.decision_type,
            shadow_selected: shadow.selected.clone(),
        });
    }
}

/// Id of the command candidate to dispatch, if the decision calls for one.
fn command_to_run(outcome: &DecideOutcome) -> Option<String> {
    if outcome.decision.decision_type != DecisionType::NextStep {
        return None;
    }
    let chosen = outcome.decision.chosen_id.as_deref()?;
    outcome
        .score
        .ranked
        .iter()
        .find(|scored| scored.id() == chosen)
        .filter(|scored| scored.action_type() == ActionType::CommandTrigger)
        .map(|scored| scored.id().to_string())
}

fn gate_context(root: &Path, cfg: &EngineConfig, request: &DecideRequest) -> GateContext {
    let git = GitProbe::new(root);
    let probed = match git.branch() {
        Ok(branch) => Some(branch),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "branch unknown");
            None
        }
    };
    let branch = guarded_branch(
        probed,
        request.branch_override.as_deref(),
        &cfg.dispatch.protected_branches,
    );
    let worktree_clean = match git.dirty_paths(&ENGINE_OWNED_PREFIXES) {
        Ok(dirty) => Some(dirty.is_empty()),
        Err(err) => {
            debug!(err = %format!("{err:#}"), "worktree status unknown");
            None
        }
    };
    GateContext {
        branch,
        protected_branches: cfg.dispatch.protected_branches.clone(),
        live_enabled: cfg.safety.enable_live,
        mode: request.mode,
        worktree_clean,
        ci: running_in_ci(|name| std::env::var(name).ok()),
    }
}

/// Branch the guards judge. The checked-out branch always counts, and an
/// unknown one stays unknown. An override only wins when it is protected.
fn guarded_branch(
    probed: Option<String>,
    requested: Option<&str>,
    protected: &[String],
) -> Option<String> {
    let probed = probed?;
    match requested {
        Some(requested) if requested != probed => {
            if protected.iter().any(|name| name == requested) {
                Some(requested.to_string())
            } else {
                warn!(checked_out = %probed, requested, "branch override ignored; guarding the checked-out branch");
                Some(probed)
            }
        }
        _ => Some(probed),
    }
}

fn running_in_ci<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    CI_ENV_VARS.iter().any(|name| {
        lookup(name).is_some_and(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
    })
}

fn build_job(
    cfg: &EngineConfig,
    request: &DecideRequest,
    decision: &Decision,
    resolved: &ResolvedCommand,
    branch: Option<String>,
) -> DispatchJob {
    let idempotency_key = IdempotencyKey::new(
        request.flow_id.as_str(),
        request.task_id.as_str(),
        request.step_id.as_str(),
    );
    DispatchJob {
        job_id: job_id(&decision.decision_id, &idempotency_key, request.mode),
        candidate_id: resolved.entry_id.clone(),
        resolved_command: resolved.argv.clone(),
        idempotency_key,
        mode: request.mode,
        category: resolved.category.clone(),
        branch,
        destructive: resolved.destructive,
        mutates_state: resolved.mutates_state,
        emits: resolved.emits,
        decision_id: Some(decision.decision_id.clone()),
        timeout_ms: cfg.dispatch.job_timeout_secs.saturating_mul(1_000),
        submitted_at: Utc::now(),
    }
}

fn job_id(decision_id: &str, key: &IdempotencyKey, mode: ExecMode) -> String {
    let mut hasher = Sha256::new();
    let mode = mode.to_string();
    for field in [
        decision_id,
        key.flow_id.as_str(),
        key.task_id.as_str(),
        key.step_id.as_str(),
        mode.as_str(),
    ] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("job-{}", &digest[..12])
}
