//! Error taxonomy for the orchestrator.
//!
//! Component boundaries return typed errors; I/O helpers below them use
//! `anyhow` with context and are mapped into these types where they surface.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed vocabulary for failures attached to steps and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A step was reached before its dependencies completed. Resolved by skipping.
    DependencyNotMet,
    /// The agent exited non-zero, could not be started, or broke its contract.
    StepExecution,
    /// The step or probe exceeded its deadline.
    Timeout,
    /// A health probe itself failed.
    AgentHealth,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::DependencyNotMet => "dependency-not-met",
            ErrorKind::StepExecution => "step-execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AgentHealth => "agent-health",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failure of a single agent invocation or probe.
///
/// This is the `Err` half of a step outcome; the `Ok` half is the agent's
/// JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StepExecution, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("agent execution timed out after {}ms", after.as_millis()),
        )
    }

    pub fn dependencies_not_met(missing: &[String]) -> Self {
        Self::new(
            ErrorKind::DependencyNotMet,
            format!("dependencies not met: {}", missing.join(", ")),
        )
    }

    pub fn health(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AgentHealth, message)
    }

    /// Whether the engine should count this failure against the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::StepExecution | ErrorKind::Timeout)
    }
}

/// Loading or validating a pipeline configuration failed. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("read configuration {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse configuration {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration {} does not match schema:\n- {}", .path.display(), .violations.join("\n- "))]
    Schema {
        path: PathBuf,
        violations: Vec<String>,
    },

    #[error("invalid configuration:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

/// The engine refused to run a workflow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("workflow '{workflow_id}' is invalid:\n- {}", .errors.join("\n- "))]
    InvalidWorkflow {
        workflow_id: String,
        errors: Vec<String>,
    },

    #[error("engine closed; workflow '{workflow_id}' was not started")]
    Closed { workflow_id: String },
}

/// Errors surfaced by the pipeline coordinator's public operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("pipeline not initialized")]
    NotInitialized,

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow is disabled: {0}")]
    WorkflowDisabled(String),

    #[error("coordinator has been shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("save configuration: {0:#}")]
    Save(anyhow::Error),
}
