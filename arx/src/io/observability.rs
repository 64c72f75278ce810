//! Structured engine events.
//!
//! Every event is traced. When metrics are enabled the events are also
//! appended to `.arx/logs/events.jsonl` as `{schema_version, timestamp,
//! event, ...}` lines.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::types::{DecisionType, ErrorKind, ExecMode, ExecutionStatus};
use crate::io::config::SafetyConfig;
use crate::io::init::ArxPaths;

pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Max length of a sanitized label value.
pub const MAX_LABEL_LEN: usize = 64;

/// Fields holding label-like values that get sanitized before writing.
const LABEL_FIELDS: [&str; 3] = ["category", "candidate_id", "status"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    DecisionMade {
        decision_id: String,
        decision_type: DecisionType,
        chosen_id: Option<String>,
        option_count: usize,
        confidence: f64,
        gap: f64,
        explored_from: Option<String>,
    },
    ShadowDivergence {
        decision_id: String,
        live_type: DecisionType,
        shadow_type: DecisionType,
        shadow_selected: Vec<String>,
    },
    CandidateExcluded {
        candidate_id: String,
        reason: String,
    },
    DispatchStarted {
        job_id: String,
        candidate_id: String,
        category: String,
        mode: ExecMode,
        attempt: u32,
    },
    DispatchRetry {
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    DispatchFinished {
        job_id: String,
        candidate_id: String,
        category: String,
        status: ExecutionStatus,
        latency_ms: u64,
        attempts: u32,
        error_kind: Option<ErrorKind>,
    },
    QueueDepth {
        category: String,
        depth: usize,
        running: usize,
    },
    DuplicateSuppressed {
        key: String,
        mode: ExecMode,
        candidate_id: String,
    },
    RecoveryPerformed {
        path: String,
        reason: String,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::DecisionMade { .. } => "decision_made",
            EngineEvent::ShadowDivergence { .. } => "shadow_divergence",
            EngineEvent::CandidateExcluded { .. } => "candidate_excluded",
            EngineEvent::DispatchStarted { .. } => "dispatch_started",
            EngineEvent::DispatchRetry { .. } => "dispatch_retry",
            EngineEvent::DispatchFinished { .. } => "dispatch_finished",
            EngineEvent::QueueDepth { .. } => "queue_depth",
            EngineEvent::DuplicateSuppressed { .. } => "duplicate_suppressed",
            EngineEvent::RecoveryPerformed { .. } => "recovery_performed",
        }
    }
}

/// Destination for engine events. Emitting never fails the caller.
pub trait ObservabilitySink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Traces events only.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        trace_event(event);
    }
}

fn trace_event(event: &EngineEvent) {
    match serde_json::to_string(event) {
        Ok(payload) => info!(target: "arx::events", event = event.name(), %payload),
        Err(err) => warn!(event = event.name(), err = %err, "failed to serialize event"),
    }
}

/// Traces events and appends them to a JSONL file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl ObservabilitySink for JsonlSink {
    fn emit(&self, event: &EngineEvent) {
        trace_event(event);
        let line = match event_line(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(err = %err, "failed to encode event line");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = file.write_all(line.as_bytes()) {
            warn!(path = %self.path.display(), err = %err, "failed to write event");
        }
    }
}

fn event_line(event: &EngineEvent) -> Result<String> {
    let mut value = serde_json::to_value(event).context("serialize event")?;
    if let Value::Object(map) = &mut value {
        for field in LABEL_FIELDS {
            if let Some(Value::String(label)) = map.get_mut(field) {
                *label = sanitize_label(label);
            }
        }
        map.insert("schema_version".to_string(), Value::from(EVENT_SCHEMA_VERSION));
        map.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));
    }
    let mut line = serde_json::to_string(&value).context("encode event")?;
    line.push('\n');
    Ok(line)
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ObservabilitySink for MemorySink {
    fn emit(&self, event: &EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Replace characters outside `[A-Za-z0-9_./-]` with `_` and cap the length.
pub fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_LEN)
        .collect()
}

/// Sink for a workspace: JSONL when metrics are enabled, tracing otherwise.
pub fn sink_for(paths: &ArxPaths, safety: &SafetyConfig) -> Result<Arc<dyn ObservabilitySink>> {
    if safety.enable_metrics {
        debug!(path = %paths.events_path.display(), "event log enabled");
        Ok(Arc::new(JsonlSink::open(&paths.events_path)?))
    } else {
        Ok(Arc::new(TracingSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_label("coder pool#1"), "coder_pool_1");
        assert_eq!(sanitize_label("a.b/c-d_e"), "a.b/c-d_e");
        assert_eq!(sanitize_label(&"x".repeat(100)).len(), MAX_LABEL_LEN);
    }

    #[test]
    fn jsonl_sink_writes_versioned_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("events.jsonl");
        let sink = JsonlSink::open(&path).expect("open");
        sink.emit(&EngineEvent::QueueDepth {
            category: "auditor pool".to_string(),
            depth: 2,
            running: 1,
        });
        sink.emit(&EngineEvent::RecoveryPerformed {
            path: "state/workflow.json".to_string(),
            reason: "eof".to_string(),
        });

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "queue_depth");
        assert_eq!(lines[0]["schema_version"], 1);
        assert_eq!(lines[0]["category"], "auditor_pool");
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[1]["event"], "recovery_performed");
    }

    #[test]
    fn sink_for_respects_metrics_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArxPaths::new(temp.path());
        let sink = sink_for(&paths, &SafetyConfig::default()).expect("sink");
        sink.emit(&EngineEvent::CandidateExcluded {
            candidate_id: "x".to_string(),
            reason: "bad".to_string(),
        });
        assert!(!paths.events_path.exists());

        let enabled = SafetyConfig {
            enable_metrics: true,
            ..SafetyConfig::default()
        };
        let sink = sink_for(&paths, &enabled).expect("sink");
        sink.emit(&EngineEvent::CandidateExcluded {
            candidate_id: "x".to_string(),
            reason: "bad".to_string(),
        });
        assert!(paths.events_path.is_file());
    }
}
