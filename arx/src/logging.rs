//! Diagnostics for the engine.
//!
//! Three outputs, kept apart:
//!
//! - **Tracing (this module)**: filtered by `RUST_LOG`, written to stderr,
//!   never persisted.
//! - **Observability events (`io/observability`)**: `.arx/logs/events.jsonl`,
//!   only when metrics are enabled.
//! - **Decision log (`io/decision_log`)**: one line per decision, always
//!   written regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "warn,arx=debug" } else { "warn" }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `verbose`.
///
/// ```bash
/// RUST_LOG=arx::queue=debug arx decide candidates.json --flow F1 --task T1 --step S1
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
