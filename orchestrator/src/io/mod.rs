//! Side-effecting helpers: processes, manifests, probes, configuration files.

pub mod artifacts;
pub mod config;
pub mod executor;
pub mod manifest;
pub mod probe;
pub mod process;
