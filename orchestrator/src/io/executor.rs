//! Executor abstraction for agent invocation.
//!
//! The [`AgentExecutor`] trait decouples the workflow engine from the actual
//! agent backend (an external process described by an `agent.toml`
//! manifest). Tests use scripted executors that return predetermined outcomes
//! without spawning processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::error::AgentError;
use crate::io::manifest::{MANIFEST_FILE, load_manifest, manifest_path};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Step config keys consumed by the orchestrator and never forwarded.
pub const RESERVED_CONFIG_KEYS: &[&str] = &["agentPath", "timeout"];

/// Default cap on captured stdout/stderr per invocation.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Parameters for one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInvocation {
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub agent_id: String,
    /// Resolved agent directory.
    pub agent_path: PathBuf,
    /// Step config merged with request config.
    pub config: Map<String, Value>,
    pub timeout: Duration,
}

/// Abstraction over agent execution backends.
pub trait AgentExecutor: Send + Sync {
    /// Run the agent once. `Ok` carries its JSON output.
    fn invoke(&self, invocation: &AgentInvocation) -> Result<Value, AgentError>;
}

impl<T: AgentExecutor + ?Sized> AgentExecutor for std::sync::Arc<T> {
    fn invoke(&self, invocation: &AgentInvocation) -> Result<Value, AgentError> {
        (**self).invoke(invocation)
    }
}

/// Agent directory for a step: explicit `agentPath` in the step config, then
/// the registered agent's path, then `../<agent-id>`.
pub fn resolve_agent_path(
    config: &Map<String, Value>,
    registered: Option<&Path>,
    agent_id: &str,
) -> PathBuf {
    if let Some(path) = config.get("agentPath").and_then(Value::as_str) {
        return PathBuf::from(path);
    }
    match registered {
        Some(path) => path.to_path_buf(),
        None => Path::new("..").join(agent_id),
    }
}

/// Render step config as command-line arguments.
///
/// `--key value` per entry; `true` is a bare flag; `false` and `null` are
/// omitted; strings are passed raw and anything else as compact JSON. The
/// execution and workflow ids are always appended.
pub fn build_agent_arguments(invocation: &AgentInvocation) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in &invocation.config {
        if RESERVED_CONFIG_KEYS.contains(&key.as_str()) {
            continue;
        }
        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => args.push(format!("--{key}")),
            Value::String(s) => {
                args.push(format!("--{key}"));
                args.push(s.clone());
            }
            other => {
                args.push(format!("--{key}"));
                args.push(other.to_string());
            }
        }
    }
    args.push("--execution-id".to_string());
    args.push(invocation.execution_id.clone());
    args.push("--workflow-id".to_string());
    args.push(invocation.workflow_id.clone());
    args
}

/// Successful agent output: stdout as JSON when it parses, otherwise the raw
/// streams wrapped in an object.
pub fn parse_agent_output(output: &CommandOutput) -> Value {
    let stdout = output.stdout_lossy();
    if let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) {
        return value;
    }
    json!({
        "stdout": stdout,
        "stderr": output.stderr_lossy(),
        "exitCode": output.status.code(),
    })
}

/// Executor that spawns the agent described by its manifest.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    pub output_limit_bytes: usize,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl AgentExecutor for ProcessExecutor {
    #[instrument(skip_all, fields(agent = %invocation.agent_id, step = %invocation.step_id))]
    fn invoke(&self, invocation: &AgentInvocation) -> Result<Value, AgentError> {
        let dir = &invocation.agent_path;
        if !dir.exists() {
            return Err(AgentError::execution(format!(
                "agent path not found: {}",
                dir.display()
            )));
        }
        if !manifest_path(dir).exists() {
            return Err(AgentError::execution(format!(
                "{MANIFEST_FILE} not found in {}",
                dir.display()
            )));
        }
        let manifest = load_manifest(dir).map_err(|e| AgentError::execution(format!("{e:#}")))?;

        let mut cmd = manifest.command(dir);
        cmd.args(build_agent_arguments(invocation));
        info!(path = %dir.display(), "invoking agent");

        let output = run_command_with_timeout(cmd, invocation.timeout, self.output_limit_bytes)
            .map_err(|e| AgentError::execution(format!("{e:#}")))?;

        if output.timed_out {
            warn!(
                timeout_ms = invocation.timeout.as_millis() as u64,
                "agent timed out"
            );
            return Err(AgentError::timeout(invocation.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "agent failed");
            let detail = if stderr.trim().is_empty() {
                format!("agent exited with status {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            };
            return Err(AgentError::execution(detail));
        }

        debug!("agent completed successfully");
        Ok(parse_agent_output(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(config: Value) -> AgentInvocation {
        AgentInvocation {
            execution_id: "exec-1".to_string(),
            workflow_id: "wf".to_string(),
            step_id: "s".to_string(),
            agent_id: "a".to_string(),
            agent_path: PathBuf::from("/tmp/a"),
            config: config.as_object().cloned().unwrap_or_default(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn renders_config_as_flags() {
        let args = build_agent_arguments(&invocation(json!({
            "path": "./app",
            "verbose": true,
            "dryRun": false,
            "skip": null,
            "limit": 5,
            "maxDepth": 2,
            "tags": ["a", "b"],
            "agentPath": "/elsewhere",
            "timeout": 10
        })));
        assert_eq!(
            args,
            vec![
                "--limit",
                "5",
                "--maxDepth",
                "2",
                "--path",
                "./app",
                "--tags",
                "[\"a\",\"b\"]",
                "--verbose",
                "--execution-id",
                "exec-1",
                "--workflow-id",
                "wf",
            ]
        );
    }

    #[test]
    fn agent_path_prefers_step_config() {
        let mut config = Map::new();
        assert_eq!(
            resolve_agent_path(&config, None, "auto-fix"),
            Path::new("../auto-fix")
        );
        assert_eq!(
            resolve_agent_path(&config, Some(Path::new("/agents/fix")), "auto-fix"),
            Path::new("/agents/fix")
        );
        config.insert("agentPath".to_string(), json!("/override"));
        assert_eq!(
            resolve_agent_path(&config, Some(Path::new("/agents/fix")), "auto-fix"),
            Path::new("/override")
        );
    }

    #[test]
    fn missing_agent_dir_is_execution_error() {
        let mut inv = invocation(json!({}));
        inv.agent_path = PathBuf::from("/definitely/missing/agent");
        let err = ProcessExecutor::default().invoke(&inv).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::StepExecution);
        assert!(err.message.contains("agent path not found"));
    }
}
