//! Decision-scoring and orchestration engine.
//!
//! The crate ranks competing candidate actions, classifies the ranking into a
//! confidence-based decision, resolves the chosen action to a parameterized
//! command, and dispatches it through a bounded, idempotent worker queue while
//! keeping durable workflow state. The architecture enforces a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (scoring, gating, registry
//!   validation, the workflow graph). No I/O, safe to call concurrently.
//! - **[`io`]**: Side-effecting operations (state file, logs, processes, git).
//!
//! [`queue`] owns the worker pools, and [`decide`] wires one full round
//! together for the CLI.

pub mod core;
pub mod decide;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod queue;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
