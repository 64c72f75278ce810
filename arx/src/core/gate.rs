//! Confidence gate: turns a ranking into NEXT_STEP, OPTION_SET or ASK_CLARIFY.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::scorer::ScoreReport;
use crate::core::types::{ActionType, Decision, DecisionType, ScoredCandidate, ShadowReport};

/// Upper bound on the exploration probability.
pub const MAX_EXPLORATION_RATE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub t_high: f64,
    pub t_mid: f64,
    /// Maximum top-vs-second gap that still counts as a near tie.
    pub epsilon: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            t_high: 0.75,
            t_mid: 0.55,
            epsilon: 0.05,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        if ![self.t_high, self.t_mid, self.epsilon]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err("thresholds must be finite".to_string());
        }
        if self.t_mid < 0.0 || self.t_mid > self.t_high {
            return Err(format!(
                "thresholds require 0 <= t_mid <= t_high (got t_mid={}, t_high={})",
                self.t_mid, self.t_high
            ));
        }
        if self.epsilon < 0.0 {
            return Err(format!("epsilon must be >= 0 (got {})", self.epsilon));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exploration {
    pub enabled: bool,
    pub rate: f64,
    /// Fixed RNG seed for reproducible rounds; entropy when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for Exploration {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 0.1,
            seed: None,
        }
    }
}

impl Exploration {
    pub fn validate(&self) -> Result<(), String> {
        if !self.rate.is_finite() || !(0.0..=MAX_EXPLORATION_RATE).contains(&self.rate) {
            return Err(format!(
                "exploration rate must be within [0, {MAX_EXPLORATION_RATE}] (got {})",
                self.rate
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub thresholds: Thresholds,
    pub exploration: Exploration,
    /// Alternative thresholds evaluated alongside the live set, never acted on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow: Option<Thresholds>,
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate()?;
        self.exploration.validate()?;
        if let Some(shadow) = &self.shadow {
            shadow
                .validate()
                .map_err(|err| format!("shadow {err}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub decision_type: DecisionType,
    pub chosen_id: Option<String>,
    pub option_set: Vec<String>,
    pub confidence: f64,
    pub gap: f64,
}

impl GateOutcome {
    /// Ids this outcome would act on or offer.
    pub fn selected(&self) -> Vec<String> {
        match self.decision_type {
            DecisionType::NextStep => self.chosen_id.iter().cloned().collect(),
            DecisionType::OptionSet => self.option_set.clone(),
            DecisionType::AskClarify => Vec::new(),
        }
    }
}

/// Classify an already-ranked list (best first).
pub fn classify(ranked: &[ScoredCandidate], thresholds: &Thresholds) -> GateOutcome {
    let Some(top) = ranked.first() else {
        return GateOutcome {
            decision_type: DecisionType::AskClarify,
            chosen_id: None,
            option_set: Vec::new(),
            confidence: 0.0,
            gap: 0.0,
        };
    };
    let top_score = top.final_score;
    let gap = ranked
        .get(1)
        .map(|second| top_score - second.final_score)
        .unwrap_or(top_score);

    let mut outcome = GateOutcome {
        decision_type: DecisionType::AskClarify,
        chosen_id: None,
        option_set: Vec::new(),
        confidence: top_score,
        gap,
    };

    if top_score >= thresholds.t_high {
        outcome.decision_type = DecisionType::NextStep;
        outcome.chosen_id = Some(top.id().to_string());
    } else if top_score >= thresholds.t_mid && gap <= thresholds.epsilon {
        outcome.decision_type = DecisionType::OptionSet;
        outcome.option_set = ranked
            .iter()
            .take_while(|c| top_score - c.final_score <= thresholds.epsilon)
            .map(|c| c.id().to_string())
            .collect();
    }
    outcome
}

/// With probability `rate`, swap a NATURAL_STEP `NEXT_STEP` choice for another
/// NATURAL_STEP candidate. Returns the substituted id.
///
/// COMMAND_TRIGGER candidates are never chosen and a COMMAND_TRIGGER top is
/// never displaced.
pub fn explore<R: Rng>(
    outcome: &GateOutcome,
    ranked: &[ScoredCandidate],
    exploration: &Exploration,
    rng: &mut R,
) -> Option<String> {
    if !exploration.enabled || outcome.decision_type != DecisionType::NextStep {
        return None;
    }
    let chosen = outcome.chosen_id.as_deref()?;
    let top = ranked.iter().find(|c| c.id() == chosen)?;
    if top.action_type() != ActionType::NaturalStep {
        return None;
    }
    let alternatives: Vec<&ScoredCandidate> = ranked
        .iter()
        .filter(|c| c.action_type() == ActionType::NaturalStep && c.id() != chosen)
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    let rate = exploration.rate.clamp(0.0, MAX_EXPLORATION_RATE);
    if !rng.gen_bool(rate) {
        return None;
    }
    let pick = alternatives[rng.gen_range(0..alternatives.len())];
    Some(pick.id().to_string())
}

/// Evaluate the shadow thresholds on the same ranking.
pub fn shadow_compare(
    live: &GateOutcome,
    ranked: &[ScoredCandidate],
    shadow: &Thresholds,
) -> ShadowReport {
    let outcome = classify(ranked, shadow);
    let diverged =
        outcome.decision_type != live.decision_type || outcome.selected() != live.selected();
    ShadowReport {
        decision_type: outcome.decision_type,
        selected: outcome.selected(),
        diverged,
    }
}

/// Run the gate over a score report and produce the loggable decision.
pub fn build_decision<R: Rng>(
    report: &ScoreReport,
    config: &GateConfig,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Decision {
    let mut outcome = classify(&report.ranked, &config.thresholds);
    // Shadow sees the unperturbed outcome.
    let shadow = config
        .shadow
        .as_ref()
        .map(|thresholds| shadow_compare(&outcome, &report.ranked, thresholds));

    let mut explored_from = None;
    if let Some(substitute) = explore(&outcome, &report.ranked, &config.exploration, rng) {
        explored_from = outcome.chosen_id.replace(substitute);
    }

    Decision {
        decision_id: decision_id(report, &outcome, now),
        decision_type: outcome.decision_type,
        chosen_id: outcome.chosen_id,
        option_set: outcome.option_set,
        confidence: outcome.confidence,
        gap: outcome.gap,
        timestamp: now,
        calibration_version: report.calibration_version.clone(),
        explored_from,
        shadow,
    }
}

fn decision_id(report: &ScoreReport, outcome: &GateOutcome, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(now.to_rfc3339().as_bytes());
    hasher.update(outcome.decision_type.to_string().as_bytes());
    for candidate in &report.ranked {
        hasher.update(candidate.id().as_bytes());
        hasher.update(candidate.final_score.to_be_bytes());
    }
    for id in outcome.selected() {
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    format!("dec-{}", hex::encode(&digest[..6]))
}
