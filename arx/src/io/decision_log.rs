//! Append-only decision log (`.arx/logs/decisions.jsonl`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::Decision;

/// Append one decision as a JSON line and flush it to disk.
pub fn append_decision(path: &Path, decision: &Decision) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(decision).context("serialize decision")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open decision log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append decision log {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync decision log {}", path.display()))?;
    debug!(decision_id = %decision.decision_id, "decision logged");
    Ok(())
}

/// Read every decision in order. A missing log is empty.
pub fn read_decisions(path: &Path) -> Result<Vec<Decision>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read decision log {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse decision log {} line {}", path.display(), idx + 1))
        })
        .collect()
}
