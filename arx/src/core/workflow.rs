//! Workflow phases and the static transition graph.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Workflow phase. The set and the edges between phases are fixed at compile
/// time; registry entries and the state file can only name these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Planning,
    Implementing,
    Reviewing,
    Testing,
    Releasing,
    Done,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Intake,
        Phase::Planning,
        Phase::Implementing,
        Phase::Reviewing,
        Phase::Testing,
        Phase::Releasing,
        Phase::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Planning => "planning",
            Phase::Implementing => "implementing",
            Phase::Reviewing => "reviewing",
            Phase::Testing => "testing",
            Phase::Releasing => "releasing",
            Phase::Done => "done",
        }
    }

    /// Phases reachable from `self` in one transition.
    pub fn successors(self) -> &'static [Phase] {
        match self {
            Phase::Intake => &[Phase::Planning],
            Phase::Planning => &[Phase::Implementing],
            Phase::Implementing => &[Phase::Reviewing, Phase::Testing],
            Phase::Reviewing => &[Phase::Implementing, Phase::Testing],
            Phase::Testing => &[Phase::Implementing, Phase::Releasing],
            Phase::Releasing => &[Phase::Implementing, Phase::Done],
            Phase::Done => &[Phase::Intake],
        }
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| EngineError::validation(format!("unknown phase '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: Phase,
    pub to: Phase,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub decision_id: Option<String>,
}

/// Durable workflow state for one run.
///
/// Invariant: `current_state` equals the last history entry's `to`, or
/// [`Phase::Intake`] when history is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_state: Phase,
    #[serde(default)]
    pub previous_state: Option<Phase>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            current_state: Phase::Intake,
            previous_state: None,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(HistoryEntry),
    /// Target equals the current phase; nothing recorded.
    NoOp,
}

impl WorkflowState {
    /// Apply a transition in memory. On error the state is left unchanged.
    pub fn apply_transition(
        &mut self,
        to: Phase,
        decision_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, EngineError> {
        let from = self.current_state;
        if to == from {
            return Ok(TransitionOutcome::NoOp);
        }
        if !from.can_transition_to(to) {
            let allowed = from
                .successors()
                .iter()
                .map(|phase| phase.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(EngineError::InvalidTransition {
                from,
                to,
                reason: format!("'{from}' may only move to [{allowed}]"),
            });
        }
        let entry = HistoryEntry {
            from,
            to,
            timestamp: now,
            decision_id: decision_id.map(str::to_string),
        };
        self.previous_state = Some(from);
        self.current_state = to;
        self.history.push(entry.clone());
        Ok(TransitionOutcome::Applied(entry))
    }

    /// Check invariants a parsed state file must hold. Returns one message per
    /// violation.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let expected_current = self
            .history
            .last()
            .map(|entry| entry.to)
            .unwrap_or(Phase::Intake);
        if self.current_state != expected_current {
            errors.push(format!(
                "current_state '{}' does not match last history entry '{}'",
                self.current_state, expected_current
            ));
        }
        let expected_previous = self.history.last().map(|entry| entry.from);
        if self.previous_state != expected_previous {
            errors.push("previous_state does not match last history entry".to_string());
        }
        let mut cursor = Phase::Intake;
        for (idx, entry) in self.history.iter().enumerate() {
            if entry.from != cursor {
                errors.push(format!(
                    "history[{idx}]: from '{}' but workflow was in '{}'",
                    entry.from, cursor
                ));
            }
            if !entry.from.can_transition_to(entry.to) {
                errors.push(format!(
                    "history[{idx}]: '{}' -> '{}' is not in the transition graph",
                    entry.from, entry.to
                ));
            }
            cursor = entry.to;
        }
        errors
    }
}
