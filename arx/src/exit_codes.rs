//! Stable exit codes for arx CLI commands.

/// Command succeeded (including advisory decisions with nothing to dispatch).
pub const OK: i32 = 0;
/// Malformed candidates, registry, config, or an invalid state transition.
pub const INVALID: i32 = 1;
/// A safety guard refused the dispatch.
pub const BLOCKED: i32 = 2;
/// The dispatched command failed, timed out, or the state store is unusable.
pub const EXECUTION_FAILED: i32 = 3;
