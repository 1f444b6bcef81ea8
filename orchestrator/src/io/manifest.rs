//! Agent manifests (`agent.toml`) describing how to launch an agent.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// File name of the manifest inside an agent directory.
pub const MANIFEST_FILE: &str = "agent.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentManifest {
    #[serde(default)]
    pub name: Option<String>,
    /// Program and leading arguments, e.g. `["node", "dist/cli.js"]`.
    pub command: Vec<String>,
    /// Arguments appended to `command` for health probes.
    #[serde(default = "default_help_args")]
    pub help_args: Vec<String>,
}

fn default_help_args() -> Vec<String> {
    vec!["--help".to_string()]
}

impl AgentManifest {
    fn validate(&self) -> Result<()> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err(anyhow!("command must be a non-empty array")),
        }
    }

    /// Build the base command for an agent living in `agent_dir`.
    ///
    /// A program containing a path separator is resolved relative to the
    /// agent directory; bare names go through `PATH`. The working directory
    /// is always the agent directory.
    pub fn command(&self, agent_dir: &Path) -> Command {
        let (program, args) = match self.command.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("", &[][..]),
        };
        let program_path = Path::new(program);
        let resolved: PathBuf = if program_path.is_relative() && program.contains('/') {
            agent_dir.join(program_path)
        } else {
            program_path.to_path_buf()
        };
        let mut cmd = Command::new(resolved);
        cmd.args(args).current_dir(agent_dir);
        cmd
    }
}

pub fn manifest_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join(MANIFEST_FILE)
}

pub fn load_manifest(agent_dir: &Path) -> Result<AgentManifest> {
    let path = manifest_path(agent_dir);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let manifest: AgentManifest =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    manifest
        .validate()
        .with_context(|| format!("invalid manifest {}", path.display()))?;
    Ok(manifest)
}
