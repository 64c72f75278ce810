//! Engine configuration stored under `.arx/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::gate::GateConfig;
use crate::core::scorer::{Calibration, Weights};
use crate::io::fsutil::write_atomic;

/// Env override for `safety.enable_live`.
pub const ENV_ALLOW_WRITES: &str = "ALLOW_WRITES";
pub const ENV_ALLOW_DESTRUCTIVE: &str = "AR_ALLOW_DESTRUCTIVE";
pub const ENV_ENABLE_RAG: &str = "AR_ENABLE_RAG";
pub const ENV_ENABLE_METRICS: &str = "AR_ENABLE_METRICS";

/// One year; claims and ledger entries never need to outlive it.
pub const MAX_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;

/// Engine configuration (TOML).
///
/// Edited by humans; every field has a default so a missing file or a partial
/// file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub gate: GateConfig,
    pub dispatch: DispatchConfig,
    pub queue: QueueConfig,
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: Weights,
    /// λ subtracted from COMMAND_TRIGGER candidates.
    pub command_bias: f64,
    /// Active calibration; must name one of `calibrations`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration_version: Option<String>,
    pub calibrations: Vec<Calibration>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            command_bias: 0.05,
            calibration_version: None,
            calibrations: Vec::new(),
        }
    }
}

impl ScoringConfig {
    pub fn active_calibration(&self) -> Option<&Calibration> {
        let version = self.calibration_version.as_deref()?;
        self.calibrations.iter().find(|c| c.version == version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Executables a live job may run (exact match on argv[0]).
    pub allowlist: Vec<String>,
    pub protected_branches: Vec<String>,
    pub job_timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            allowlist: ["git", "cargo", "just", "make"]
                .into_iter()
                .map(String::from)
                .collect(),
            protected_branches: vec!["main".to_string(), "master".to_string()],
            job_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker count per category.
    pub pools: BTreeMap<String, usize>,
    /// How long an idempotency claim is held.
    pub retention_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pools: [("coder", 4), ("auditor", 2), ("po", 1)]
                .into_iter()
                .map(|(name, size)| (name.to_string(), size))
                .collect(),
            retention_secs: 24 * 60 * 60,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Opt-in switches. Everything is off unless turned on here or via env.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SafetyConfig {
    pub enable_live: bool,
    pub enable_destructive: bool,
    /// Recorded for collaborators; the engine itself has no retrieval layer.
    pub enable_rag: bool,
    /// Write observability events to `.arx/logs/events.jsonl`.
    pub enable_metrics: bool,
}

impl SafetyConfig {
    /// Apply env overrides: `"1"` enables, `"0"` disables, anything else is
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flags: [(&str, &mut bool); 4] = [
            (ENV_ALLOW_WRITES, &mut self.enable_live),
            (ENV_ALLOW_DESTRUCTIVE, &mut self.enable_destructive),
            (ENV_ENABLE_RAG, &mut self.enable_rag),
            (ENV_ENABLE_METRICS, &mut self.enable_metrics),
        ];
        for (name, flag) in flags {
            match lookup(name).as_deref().map(str::trim) {
                Some("1") => *flag = true,
                Some("0") => *flag = false,
                _ => {}
            }
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.scoring.weights.validate().map_err(|err| anyhow!(err))?;
        if !self.scoring.command_bias.is_finite() || self.scoring.command_bias < 0.0 {
            return Err(anyhow!("scoring.command_bias must be a finite number >= 0"));
        }
        for calibration in &self.scoring.calibrations {
            calibration.validate().map_err(|err| anyhow!(err))?;
        }
        if let Some(version) = &self.scoring.calibration_version
            && self.scoring.active_calibration().is_none()
        {
            return Err(anyhow!(
                "scoring.calibration_version '{version}' has no matching calibration"
            ));
        }
        self.gate.validate().map_err(|err| anyhow!("gate: {err}"))?;

        if self.dispatch.job_timeout_secs == 0 {
            return Err(anyhow!("dispatch.job_timeout_secs must be > 0"));
        }
        if self.dispatch.output_limit_bytes == 0 {
            return Err(anyhow!("dispatch.output_limit_bytes must be > 0"));
        }
        if self.dispatch.allowlist.iter().any(|exe| exe.trim().is_empty()) {
            return Err(anyhow!("dispatch.allowlist must not contain empty entries"));
        }

        if self.queue.pools.is_empty() {
            return Err(anyhow!("queue.pools must define at least one category"));
        }
        if let Some((name, _)) = self.queue.pools.iter().find(|(_, size)| **size == 0) {
            return Err(anyhow!("queue.pools.{name} must be > 0"));
        }
        if self.queue.retention_secs == 0 || self.queue.retention_secs > MAX_RETENTION_SECS {
            return Err(anyhow!(
                "queue.retention_secs must be in 1..={MAX_RETENTION_SECS}"
            ));
        }
        if self.queue.base_delay_ms > self.queue.max_delay_ms {
            return Err(anyhow!("queue.base_delay_ms must be <= queue.max_delay_ms"));
        }
        Ok(())
    }
}

/// Load config from a TOML file, then apply env overrides.
///
/// If the file is missing, starts from `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

pub fn load_config_with_env<F>(path: &Path, lookup: F) -> Result<EngineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        debug!(path = %path.display(), "config missing, using defaults");
        EngineConfig::default()
    };
    cfg.safety.apply_env(lookup);
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Validate, then atomically replace the config file.
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config_with_env(&temp.path().join("missing.toml"), no_env).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert!(!cfg.safety.enable_live);
        assert!(!cfg.safety.enable_destructive);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.scoring.calibrations.push(Calibration::identity("v1"));
        cfg.scoring.calibration_version = Some("v1".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config_with_env(&path, no_env).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[gate.thresholds]\nt_high = 0.8\n").expect("write");
        let cfg = load_config_with_env(&path, no_env).expect("load");
        assert_eq!(cfg.gate.thresholds.t_high, 0.8);
        assert_eq!(cfg.gate.thresholds.t_mid, 0.55);
        assert_eq!(cfg.queue, QueueConfig::default());
    }

    #[test]
    fn env_overrides_enable_and_disable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[safety]\nenable_metrics = true\n").expect("write");
        let cfg = load_config_with_env(&path, |name| match name {
            ENV_ALLOW_WRITES => Some("1".to_string()),
            ENV_ENABLE_METRICS => Some("0".to_string()),
            ENV_ALLOW_DESTRUCTIVE => Some("yes".to_string()),
            _ => None,
        })
        .expect("load");
        assert!(cfg.safety.enable_live);
        assert!(!cfg.safety.enable_metrics);
        assert!(!cfg.safety.enable_destructive);
    }

    #[test]
    fn rejects_unknown_calibration_version() {
        let mut cfg = EngineConfig::default();
        cfg.scoring.calibration_version = Some("v9".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("v9"));
    }

    #[test]
    fn rejects_retention_outside_bounds() {
        let mut cfg = EngineConfig::default();
        cfg.queue.retention_secs = MAX_RETENTION_SECS + 1;
        assert!(cfg.validate().unwrap_err().to_string().contains("retention_secs"));
        cfg.queue.retention_secs = MAX_RETENTION_SECS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_exploration_above_bound() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[gate.exploration]\nenabled = true\nrate = 0.9\n").expect("write");
        let err = load_config_with_env(&path, no_env).unwrap_err();
        assert!(format!("{err:#}").contains("exploration rate"));
    }
}
