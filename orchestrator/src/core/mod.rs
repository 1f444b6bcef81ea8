//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod agent;
pub mod analytics;
pub mod execution;
pub mod gates;
pub mod report;
pub mod results;
pub mod workflow;
