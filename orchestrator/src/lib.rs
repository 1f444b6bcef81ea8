//! Agent pipeline orchestrator.
//!
//! Runs a roster of external agents through dependency-gated workflows with
//! retries, timeouts, and health supervision. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (workflow validation, result
//!   aggregation, analytics, quality gates). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, manifests,
//!   probes, configuration files). Isolated behind traits to enable mocking.
//!
//! Stateful components ([`registry`], [`engine`], [`coordinator`]) combine the
//! two and own their tables behind mutexes.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod coordinator;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// Lock a table, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
