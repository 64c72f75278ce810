//! Deterministic candidate scoring.
//!
//! `base = Σ w_k · metric_k` over the named dimensions, followed by an optional
//! versioned calibration and a command-bias penalty for `COMMAND_TRIGGER`
//! candidates. Ranking is fully deterministic: final score descending, then
//! lower penalty, then candidate id.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{ActionType, Candidate, Exclusion, ScoredCandidate, validate_id};

/// Metric dimensions, in summation order.
pub const DIMENSIONS: [&str; 5] = ["intent", "state", "evidence", "recency", "pref"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub intent: f64,
    pub state: f64,
    pub evidence: f64,
    pub recency: f64,
    pub pref: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            intent: 0.35,
            state: 0.25,
            evidence: 0.2,
            recency: 0.1,
            pref: 0.1,
        }
    }
}

impl Weights {
    /// `(dimension, weight)` pairs in [`DIMENSIONS`] order.
    pub fn pairs(&self) -> [(&'static str, f64); 5] {
        [
            ("intent", self.intent),
            ("state", self.state),
            ("evidence", self.evidence),
            ("recency", self.recency),
            ("pref", self.pref),
        ]
    }

    /// Weights must be finite and non-negative, otherwise raising a metric
    /// could lower a score.
    pub fn validate(&self) -> Result<(), String> {
        for (name, weight) in self.pairs() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(format!("weight '{name}' must be a finite number >= 0"));
            }
        }
        Ok(())
    }
}

/// Versioned, strictly monotonic piecewise-linear remap of raw scores.
///
/// Knots are `[raw, calibrated]` pairs, strictly increasing on both axes, so
/// every version is invertible. Outside the knot range the first/last segment
/// is extended linearly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub version: String,
    pub points: Vec<[f64; 2]>,
}

impl Calibration {
    pub fn identity(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            points: vec![[0.0, 0.0], [1.0, 1.0]],
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_id(&self.version).map_err(|err| format!("calibration version: {err}"))?;
        if self.points.len() < 2 {
            return Err(format!(
                "calibration '{}' needs at least two points",
                self.version
            ));
        }
        if self.points.iter().flatten().any(|v| !v.is_finite()) {
            return Err(format!(
                "calibration '{}' has non-finite points",
                self.version
            ));
        }
        let increasing = self
            .points
            .windows(2)
            .all(|pair| pair[1][0] > pair[0][0] && pair[1][1] > pair[0][1]);
        if !increasing {
            return Err(format!(
                "calibration '{}' points must be strictly increasing on both axes",
                self.version
            ));
        }
        Ok(())
    }

    /// Map a raw score to its calibrated value.
    pub fn apply(&self, raw: f64) -> f64 {
        piecewise(self.points.iter().map(|p| (p[0], p[1])), raw)
    }

    /// Recover the raw score from a calibrated one.
    pub fn invert(&self, calibrated: f64) -> f64 {
        piecewise(self.points.iter().map(|p| (p[1], p[0])), calibrated)
    }
}

fn piecewise(points: impl Iterator<Item = (f64, f64)>, x: f64) -> f64 {
    let points: Vec<(f64, f64)> = points.collect();
    let last = points.len().saturating_sub(2);
    let idx = points
        .windows(2)
        .position(|pair| x <= pair[1].0)
        .unwrap_or(last);
    let (x0, y0) = points[idx];
    let (x1, y1) = points[idx + 1];
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// Inputs that shape a scoring round besides the candidates themselves.
#[derive(Debug, Clone, Copy)]
pub struct ScoringParams<'a> {
    pub weights: Weights,
    /// λ: subtracted from `COMMAND_TRIGGER` candidates.
    pub command_bias: f64,
    pub calibration: Option<&'a Calibration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReport {
    pub ranked: Vec<ScoredCandidate>,
    pub excluded: Vec<Exclusion>,
    pub calibration_version: Option<String>,
}

/// Score and rank candidates. Never fails: malformed candidates are excluded
/// with a recorded reason and missing metrics count as zero.
pub fn score_candidates(candidates: &[Candidate], params: &ScoringParams<'_>) -> ScoreReport {
    let mut ranked = Vec::with_capacity(candidates.len());
    let mut excluded = Vec::new();
    let mut seen = HashSet::new();

    for candidate in candidates {
        if let Err(reason) = validate_id(&candidate.id) {
            excluded.push(Exclusion {
                candidate_id: candidate.id.clone(),
                reason,
            });
            continue;
        }
        if !seen.insert(candidate.id.as_str()) {
            excluded.push(Exclusion {
                candidate_id: candidate.id.clone(),
                reason: "duplicate candidate id".to_string(),
            });
            continue;
        }
        if let Some(reason) = metric_problem(candidate) {
            excluded.push(Exclusion {
                candidate_id: candidate.id.clone(),
                reason,
            });
            continue;
        }
        ranked.push(score_one(candidate, params));
    }

    ranked.sort_by(compare_ranked);

    ScoreReport {
        ranked,
        excluded,
        calibration_version: params.calibration.map(|c| c.version.clone()),
    }
}

/// First metric that is not a finite number in `[0, 1]`, as a reason string.
fn metric_problem(candidate: &Candidate) -> Option<String> {
    candidate.metrics.iter().find_map(|(name, value)| {
        let Some(number) = value.as_f64() else {
            return Some(format!(
                "metric '{name}' is not numeric ({})",
                value_kind(value)
            ));
        };
        if !number.is_finite() || !(0.0..=1.0).contains(&number) {
            return Some(format!("metric '{name}' = {number} is outside [0, 1]"));
        }
        None
    })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn score_one(candidate: &Candidate, params: &ScoringParams<'_>) -> ScoredCandidate {
    let base_score = params
        .weights
        .pairs()
        .iter()
        .map(|(dimension, weight)| {
            let metric = candidate
                .metrics
                .get(*dimension)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            weight * metric
        })
        .sum::<f64>();
    let calibrated_score = params
        .calibration
        .map(|calibration| calibration.apply(base_score))
        .unwrap_or(base_score);
    let command_bias_penalty = match candidate.action_type {
        ActionType::CommandTrigger => params.command_bias,
        ActionType::NaturalStep => 0.0,
    };
    ScoredCandidate {
        candidate: candidate.clone(),
        base_score,
        command_bias_penalty,
        calibrated_score,
        final_score: calibrated_score - command_bias_penalty,
    }
}

fn compare_ranked(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then_with(|| a.command_bias_penalty.total_cmp(&b.command_bias_penalty))
        .then_with(|| a.id().cmp(b.id()))
}
