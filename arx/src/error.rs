//! Error taxonomy shared by every engine component.
//!
//! Plumbing code returns `anyhow::Result` and attaches context; the typed
//! [`EngineError`] sits at the bottom of the chain so callers (the CLI, the
//! queue) can classify a failure without string matching.

use thiserror::Error;

use crate::core::types::ErrorKind;
use crate::core::workflow::Phase;
use crate::exit_codes;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed candidate, registry, config, or context input.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: Phase,
        to: Phase,
        reason: String,
    },

    #[error("blocked by guard '{guard}': {reason}")]
    BlockedByGuard { guard: String, reason: String },

    #[error("duplicate suppressed for idempotency key {key}")]
    DuplicateSuppressed { key: String },

    /// Non-zero exit or spawn failure of an external command.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("state store corruption at {path}: {reason}")]
    StoreCorruption { path: String, reason: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn blocked(guard: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BlockedByGuard {
            guard: guard.into(),
            reason: reason.into(),
        }
    }

    /// Persisted classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::BlockedByGuard { .. } => ErrorKind::BlockedByGuard,
            Self::DuplicateSuppressed { .. } => ErrorKind::DuplicateSuppressed,
            Self::ExecutionFailure(_) => ErrorKind::ExecutionFailure,
            Self::StoreCorruption { .. } => ErrorKind::StoreCorruption,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::InvalidTransition { .. } => exit_codes::INVALID,
            Self::DuplicateSuppressed { .. } => exit_codes::OK,
            Self::BlockedByGuard { .. } => exit_codes::BLOCKED,
            Self::ExecutionFailure(_) | Self::StoreCorruption { .. } => {
                exit_codes::EXECUTION_FAILED
            }
        }
    }
}

/// Find the first [`EngineError`] in an `anyhow` chain.
pub fn find_engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
}

/// Map an arbitrary error to a CLI exit code. Untyped errors (unreadable
/// files, bad config) are treated as validation failures.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    find_engine_error(err)
        .map(EngineError::exit_code)
        .unwrap_or(exit_codes::INVALID)
}
