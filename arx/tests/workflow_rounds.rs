//! Dispatch outcomes feed the workflow phase, which gates the next round.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use arx::core::registry::{RegistryDocument, RegistryEntry};
use arx::core::types::{ActionType, Candidate, ExecMode, ExecutionStatus};
use arx::core::workflow::Phase;
use arx::decide::{DecideRequest, decide_and_dispatch};
use arx::io::config::{EngineConfig, write_config};
use arx::io::init::{InitOptions, init_workspace};
use arx::io::observability::TracingSink;
use arx::io::state_store::WorkflowStateStore;
use arx::test_support::{ScriptedRunner, candidate, git_checkout, registry_entry};

fn staged_entry(id: &str, runs_in: Phase, emits: Phase) -> RegistryEntry {
    RegistryEntry {
        required_states: vec![runs_in],
        emits: Some(emits),
        ..registry_entry(id)
    }
}

fn strong(id: &str) -> Candidate {
    candidate(
        id,
        ActionType::CommandTrigger,
        &[("intent", 1.0), ("state", 1.0), ("evidence", 1.0), ("recency", 1.0), ("pref", 1.0)],
    )
}

fn request(step: &str) -> DecideRequest {
    DecideRequest {
        candidates: vec![strong("plan"), strong("implement")],
        mode: ExecMode::Live,
        flow_id: "F1".to_string(),
        task_id: "T1".to_string(),
        step_id: step.to_string(),
        context: BTreeMap::new(),
        branch_override: None,
    }
}

#[test]
fn each_round_sees_the_phase_the_previous_one_emitted() {
    let temp = tempfile::tempdir().expect("tempdir");
    git_checkout(temp.path(), "feature/x");
    let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
    let mut cfg = EngineConfig::default();
    cfg.safety.enable_live = true;
    write_config(&paths.config_path, &cfg).expect("config");
    let registry = RegistryDocument {
        version: 1,
        entries: vec![
            staged_entry("plan", Phase::Intake, Phase::Planning),
            staged_entry("implement", Phase::Planning, Phase::Implementing),
        ],
    };
    fs::write(
        &paths.registry_path,
        serde_json::to_string_pretty(&registry).expect("json"),
    )
    .expect("registry");
    let runner = Arc::new(ScriptedRunner::new(vec![]));

    let first = decide_and_dispatch(temp.path(), &request("S1"), Arc::clone(&runner)).expect("round 1");
    assert_eq!(first.phase, Phase::Intake);
    assert_eq!(first.decision.chosen_id.as_deref(), Some("plan"));
    assert_eq!(first.dispatch.expect("dispatch").status, ExecutionStatus::Success);

    let second = decide_and_dispatch(temp.path(), &request("S2"), Arc::clone(&runner)).expect("round 2");
    assert_eq!(second.phase, Phase::Planning);
    assert_eq!(second.decision.chosen_id.as_deref(), Some("implement"));
    assert_eq!(second.dispatch.expect("dispatch").status, ExecutionStatus::Success);

    let store = WorkflowStateStore::open(&paths, Arc::new(TracingSink));
    let document = store.document().expect("document");
    assert_eq!(document.state.current_state, Phase::Implementing);
    assert_eq!(document.state.previous_state, Some(Phase::Planning));
    assert_eq!(document.state.history.len(), 2);
    assert_eq!(document.executions.len(), 2);
    assert!(paths.state_backup_path.is_file());
}
