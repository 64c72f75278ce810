//! Registry loading: JSON Schema first, then whole-set semantic validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::registry::{Registry, RegistryDocument};
use crate::error::EngineError;

const REGISTRY_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/registry.schema.json"
));

static SCHEMA: LazyLock<Value> =
    LazyLock::new(|| serde_json::from_str(REGISTRY_SCHEMA).unwrap());

/// Load and validate the registry at `path`. Fails closed: any malformed
/// entry means no registry at all.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_registry(path: &Path) -> Result<Registry> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read registry {}", path.display()))?;
    let registry =
        parse_registry(&contents).with_context(|| format!("load registry {}", path.display()))?;
    debug!(entries = registry.len(), "registry loaded");
    Ok(registry)
}

pub fn parse_registry(contents: &str) -> Result<Registry> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| EngineError::validation(format!("registry is not valid JSON: {err}")))?;
    validate_schema(&value)?;
    let document: RegistryDocument = serde_json::from_value(value)
        .map_err(|err| EngineError::validation(format!("registry document: {err}")))?;
    Ok(Registry::from_entries(document.entries)?)
}

fn validate_schema(value: &Value) -> Result<()> {
    let compiled = compiled_schema()?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(EngineError::validation(format!(
            "registry schema validation failed: {}",
            messages.join("; ")
        ))
        .into());
    }
    Ok(())
}

fn compiled_schema() -> Result<Validator> {
    validator_for(&SCHEMA).map_err(|err| anyhow!("invalid registry schema: {}", err))
}
