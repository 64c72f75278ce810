//! Initialization helpers for `.arx/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};
use crate::core::registry::{GateName, RegistryDocument, RegistryEntry};
use crate::core::types::ActionType;
use crate::core::workflow::Phase;

/// All canonical paths within `.arx/` for a project root.
#[derive(Debug, Clone)]
pub struct ArxPaths {
    pub root: PathBuf,
    pub arx_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub registry_path: PathBuf,
    pub state_path: PathBuf,
    pub state_backup_path: PathBuf,
    /// Held by a live round from claim preload until its result is recorded.
    pub dispatch_lock_path: PathBuf,
    pub decisions_path: PathBuf,
    pub events_path: PathBuf,
}

impl ArxPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let arx_dir = root.join(".arx");
        let state_dir = arx_dir.join("state");
        let logs_dir = arx_dir.join("logs");
        Self {
            root: root.clone(),
            arx_dir: arx_dir.clone(),
            state_dir: state_dir.clone(),
            logs_dir: logs_dir.clone(),
            gitignore_path: arx_dir.join(".gitignore"),
            config_path: arx_dir.join("config.toml"),
            registry_path: arx_dir.join("registry.json"),
            state_path: state_dir.join("workflow.json"),
            state_backup_path: state_dir.join("workflow.json.bak"),
            dispatch_lock_path: state_dir.join("dispatch.lock"),
            decisions_path: logs_dir.join("decisions.jsonl"),
            events_path: logs_dir.join("events.jsonl"),
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing engine-owned files.
    pub force: bool,
}

/// Create `.arx/` scaffolding in `root`.
///
/// Fails if `.arx/` already exists unless `options.force` is set. Workflow
/// state is not written here; the store creates it on first write.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<ArxPaths> {
    let paths = ArxPaths::new(root);
    if paths.arx_dir.exists() && !options.force {
        return Err(anyhow!("arx init: .arx already exists (use --force to overwrite)"));
    }
    if paths.arx_dir.exists() && !paths.arx_dir.is_dir() {
        return Err(anyhow!("arx init: .arx exists but is not a directory"));
    }

    create_dir(&paths.arx_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.logs_dir)?;

    write_file(&paths.gitignore_path, ARX_GITIGNORE)?;
    write_config(&paths.config_path, &EngineConfig::default())?;
    let mut registry =
        serde_json::to_string_pretty(&sample_registry()).context("serialize registry")?;
    registry.push('\n');
    write_file(&paths.registry_path, &registry)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

fn sample_registry() -> RegistryDocument {
    RegistryDocument {
        version: 1,
        entries: vec![RegistryEntry {
            id: "run_tests".to_string(),
            action_type: ActionType::CommandTrigger,
            command: vec!["cargo".to_string(), "test".to_string()],
            required_contexts: Vec::new(),
            required_states: vec![Phase::Implementing, Phase::Reviewing],
            gates: vec![GateName::LiveAllowed],
            emits: Some(Phase::Testing),
            category: "auditor".to_string(),
            destructive: false,
            mutates_state: false,
            description: "Run the test suite".to_string(),
        }],
    }
}

const ARX_GITIGNORE: &str = "logs/\n";
