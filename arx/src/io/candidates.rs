//! Candidate batch loading.
//!
//! The schema checks structure only. Metric values are left unconstrained so
//! the scorer can exclude bad ones individually with a reason.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::types::Candidate;
use crate::error::EngineError;

const CANDIDATES_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/candidates.schema.json"
));

static SCHEMA: LazyLock<Value> =
    LazyLock::new(|| serde_json::from_str(CANDIDATES_SCHEMA).unwrap());

pub fn load_candidates(path: &Path) -> Result<Vec<Candidate>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read candidates {}", path.display()))?;
    let candidates = parse_candidates(&contents)
        .with_context(|| format!("load candidates {}", path.display()))?;
    debug!(count = candidates.len(), "candidates loaded");
    Ok(candidates)
}

/// Parse either a bare array or `{ "candidates": [...] }`.
pub fn parse_candidates(contents: &str) -> Result<Vec<Candidate>> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| EngineError::validation(format!("candidates are not valid JSON: {err}")))?;
    let compiled =
        validator_for(&SCHEMA).map_err(|err| anyhow!("invalid candidates schema: {}", err))?;
    if !compiled.is_valid(&value) {
        let messages = compiled
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(EngineError::validation(format!(
            "candidate schema validation failed: {}",
            messages.join("; ")
        ))
        .into());
    }
    let list = match value {
        Value::Object(mut map) => map.remove("candidates").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    let candidates = serde_json::from_value(list)
        .map_err(|err| EngineError::validation(format!("candidates: {err}")))?;
    Ok(candidates)
}
