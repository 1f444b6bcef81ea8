//! Diagnostic tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: lifecycle events, retries, probe details.
//!   Controlled by `RUST_LOG`, written to stderr, never persisted.
//!
//! - **Reports**: final reports, status, and metrics are product output.
//!   The CLI prints them to stdout as JSON regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Compact format on stderr.
/// Calling it twice is harmless; the second install is ignored.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator execute full-testing-pipeline
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
