//! Command registry: validation as a whole, and resolution of one entry to a
//! concrete argv.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::template;
use crate::core::types::{ActionType, ExecMode, validate_id};
use crate::core::workflow::Phase;
use crate::error::EngineError;

pub const DEFAULT_CATEGORY: &str = "coder";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryEntry {
    pub id: String,
    pub action_type: ActionType,
    /// Argv tokens; may contain `{{name}}` placeholders.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub required_contexts: Vec<String>,
    /// Phases in which the entry is admissible; empty means any.
    #[serde(default)]
    pub required_states: Vec<Phase>,
    #[serde(default)]
    pub gates: Vec<GateName>,
    /// Phase entered when the command succeeds.
    #[serde(default)]
    pub emits: Option<Phase>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default = "default_true")]
    pub mutates_state: bool,
    #[serde(default)]
    pub description: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_true() -> bool {
    true
}

impl RegistryEntry {
    /// Whether the entry may be proposed while the workflow is in `phase`.
    pub fn admissible_in(&self, phase: Phase) -> bool {
        self.required_states.is_empty() || self.required_states.contains(&phase)
    }
}

/// Preconditions an entry can require before it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    /// Current branch must be known and not protected.
    BranchNotProtected,
    /// Live mode must be enabled (dry-run always passes).
    LiveAllowed,
    /// Git worktree must have no uncommitted changes.
    CleanWorktree,
    /// Must run inside CI.
    CiEnvironment,
}

impl GateName {
    pub fn as_str(self) -> &'static str {
        match self {
            GateName::BranchNotProtected => "branch_not_protected",
            GateName::LiveAllowed => "live_allowed",
            GateName::CleanWorktree => "clean_worktree",
            GateName::CiEnvironment => "ci_environment",
        }
    }
}

/// On-disk registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<RegistryEntry>,
}

/// A fully validated registry. Only constructible from a set of entries that
/// passes every check.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    /// Validate and index entries. Any single error rejects the whole set.
    pub fn from_entries(entries: Vec<RegistryEntry>) -> Result<Self, EngineError> {
        let errors = validate_entries(&entries);
        if !errors.is_empty() {
            return Err(EngineError::validation(format!(
                "registry rejected ({} error(s)): {}",
                errors.len(),
                errors.join("; ")
            )));
        }
        Ok(Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect(),
        })
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// Resolve `id` to an argv, checking contexts, phase and gates first.
    pub fn resolve(&self, id: &str, ctx: &ResolveContext<'_>) -> Result<ResolvedCommand, EngineError> {
        let entry = self
            .get(id)
            .ok_or_else(|| EngineError::validation(format!("no registry entry for '{id}'")))?;

        let missing: Vec<&str> = entry
            .required_contexts
            .iter()
            .filter(|key| !ctx.params.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::validation(format!(
                "'{id}' missing required context: {}",
                missing.join(", ")
            )));
        }

        if !entry.admissible_in(ctx.state) {
            let required = entry
                .required_states
                .iter()
                .map(|phase| phase.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(EngineError::validation(format!(
                "'{id}' requires state in [{required}], current state is '{}'",
                ctx.state
            )));
        }

        for gate in &entry.gates {
            ctx.gates.check(*gate)?;
        }

        let argv = template::substitute(&entry.command, ctx.params)?;
        Ok(ResolvedCommand {
            entry_id: entry.id.clone(),
            action_type: entry.action_type,
            argv,
            category: entry.category.clone(),
            destructive: entry.destructive,
            mutates_state: entry.mutates_state,
            emits: entry.emits,
        })
    }
}

/// Every problem found in `entries`, one message each.
pub fn validate_entries(entries: &[RegistryEntry]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    for (idx, entry) in entries.iter().enumerate() {
        let label = format!("entries[{idx}] '{}'", entry.id.escape_default());
        if let Err(err) = validate_id(&entry.id) {
            errors.push(format!("{label}: {err}"));
        } else if !seen.insert(entry.id.as_str()) {
            errors.push(format!("{label}: duplicate id"));
        }
        if let Err(err) = validate_id(&entry.category) {
            errors.push(format!("{label}: category {err}"));
        }

        if entry.action_type == ActionType::CommandTrigger {
            match entry.command.first() {
                None => errors.push(format!("{label}: COMMAND_TRIGGER requires a command")),
                Some(exe) if exe.trim().is_empty() || exe.contains("{{") => {
                    errors.push(format!("{label}: executable must be a literal token"));
                }
                Some(_) => {}
            }
        }

        let declared: BTreeSet<&str> = entry.required_contexts.iter().map(String::as_str).collect();
        for token in &entry.command {
            if let Err(err) = template::check_token(token) {
                errors.push(format!("{label}: {err}"));
                continue;
            }
            for name in template::placeholders(token) {
                if !declared.contains(name.as_str()) {
                    errors.push(format!(
                        "{label}: placeholder '{name}' is not declared in required_contexts"
                    ));
                }
            }
        }
    }
    errors
}

/// Facts the named gates are evaluated against. Gathered by the caller so
/// this module stays free of I/O.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub branch: Option<String>,
    pub protected_branches: Vec<String>,
    pub live_enabled: bool,
    pub mode: ExecMode,
    /// `None` when cleanliness could not be determined.
    pub worktree_clean: Option<bool>,
    pub ci: bool,
}

impl GateContext {
    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|b| b == branch)
    }

    pub fn check(&self, gate: GateName) -> Result<(), EngineError> {
        let name = gate.as_str();
        match gate {
            GateName::BranchNotProtected => match self.branch.as_deref() {
                None => Err(EngineError::blocked(name, "current branch is unknown")),
                Some(branch) if self.is_protected(branch) => Err(EngineError::blocked(
                    name,
                    format!("branch '{branch}' is protected"),
                )),
                Some(_) => Ok(()),
            },
            GateName::LiveAllowed => {
                if self.mode == ExecMode::DryRun || self.live_enabled {
                    Ok(())
                } else {
                    Err(EngineError::blocked(name, "live execution is not enabled"))
                }
            }
            GateName::CleanWorktree => match self.worktree_clean {
                Some(true) => Ok(()),
                Some(false) => Err(EngineError::blocked(name, "worktree has uncommitted changes")),
                None => Err(EngineError::blocked(name, "worktree status is unknown")),
            },
            GateName::CiEnvironment => {
                if self.ci {
                    Ok(())
                } else {
                    Err(EngineError::blocked(name, "not running in CI"))
                }
            }
        }
    }
}

pub struct ResolveContext<'a> {
    pub params: &'a BTreeMap<String, String>,
    pub state: Phase,
    pub gates: &'a GateContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCommand {
    pub entry_id: String,
    pub action_type: ActionType,
    pub argv: Vec<String>,
    pub category: String,
    pub destructive: bool,
    pub mutates_state: bool,
    pub emits: Option<Phase>,
}
