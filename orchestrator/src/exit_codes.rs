//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `execute`, the workflow finished `success` or `partial`.
pub const OK: i32 = 0;
/// Invalid configuration, unknown workflow, or any other error.
pub const INVALID: i32 = 1;
/// `orchestrator execute` ran, but the final iteration's overall status is
/// `failure` or a blocking quality gate failed.
pub const WORKFLOW_FAILED: i32 = 2;
