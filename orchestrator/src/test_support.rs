//! Test-only doubles and builders for agents, workflows, and executors.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

use crate::core::agent::{Agent, AgentStatus, CapabilityType, HealthCheckPolicy};
use crate::core::workflow::{RetryPolicy, RollbackPolicy, WorkflowDefinition, WorkflowStep};
use crate::engine::Sleeper;
use crate::error::AgentError;
use crate::io::executor::{AgentExecutor, AgentInvocation};
use crate::io::manifest::MANIFEST_FILE;
use crate::io::probe::{HealthProbe, ProbeReport};
use crate::lock;

struct Pause {
    started: Sender<()>,
    release: Receiver<()>,
}

/// Handle for an invocation held open by [`ScriptedExecutor::pause_on`].
pub struct PauseHandle {
    /// Receives once the paused invocation has started.
    pub started: Receiver<()>,
    /// Send (or drop) to let the invocation return.
    pub release: Sender<()>,
}

/// Executor returning pre-scripted results per agent id.
///
/// One-shot results queued with [`push`](Self::push) are consumed first, then
/// the [`always`](Self::always) result, then `Ok({})`.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, AgentError>>>>,
    fallback: Mutex<HashMap<String, Result<Value, AgentError>>>,
    pauses: Mutex<HashMap<String, Pause>>,
    calls: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, agent_id: &str, result: Result<Value, AgentError>) -> &Self {
        lock(&self.scripts)
            .entry(agent_id.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn always(&self, agent_id: &str, result: Result<Value, AgentError>) -> &Self {
        lock(&self.fallback).insert(agent_id.to_string(), result);
        self
    }

    /// Block the next invocation of `agent_id` until the handle releases it.
    pub fn pause_on(&self, agent_id: &str) -> PauseHandle {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        lock(&self.pauses).insert(
            agent_id.to_string(),
            Pause {
                started: started_tx,
                release: release_rx,
            },
        );
        PauseHandle {
            started: started_rx,
            release: release_tx,
        }
    }

    pub fn calls(&self) -> Vec<AgentInvocation> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, agent_id: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .count()
    }
}

impl AgentExecutor for ScriptedExecutor {
    fn invoke(&self, invocation: &AgentInvocation) -> Result<Value, AgentError> {
        lock(&self.calls).push(invocation.clone());
        let pause = lock(&self.pauses).remove(&invocation.agent_id);
        if let Some(pause) = pause {
            let _ = pause.started.send(());
            let _ = pause.release.recv();
        }
        if let Some(result) = lock(&self.scripts)
            .get_mut(&invocation.agent_id)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        match lock(&self.fallback).get(&invocation.agent_id) {
            Some(result) => result.clone(),
            None => Ok(json!({})),
        }
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        lock(&self.delays).push(duration);
    }
}

/// Probe returning queued reports per agent, then `healthy`.
#[derive(Default)]
pub struct ScriptedProbe {
    reports: Mutex<HashMap<String, VecDeque<Result<ProbeReport, AgentError>>>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn push(&self, agent_id: &str, report: Result<ProbeReport, AgentError>) -> &Self {
        lock(&self.reports)
            .entry(agent_id.to_string())
            .or_default()
            .push_back(report);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HealthProbe for ScriptedProbe {
    fn probe(&self, agent: &Agent) -> Result<ProbeReport, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.reports)
            .get_mut(&agent.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(ProbeReport::healthy()))
    }
}

/// Agent with health checks disabled and a path that does not exist.
pub fn agent(id: &str) -> Agent {
    Agent {
        id: id.to_string(),
        name: format!("{id} agent"),
        capability: CapabilityType::QualityAnalyzer,
        status: AgentStatus::Active,
        path: PathBuf::from(format!("/nonexistent/agents/{id}")),
        dependencies: Vec::new(),
        config: Map::new(),
        health_check: HealthCheckPolicy::default(),
    }
}

/// Required step with no retries, run by the agent of the same id.
pub fn step(id: &str, order: i64) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        name: format!("{id} step"),
        agent_id: id.to_string(),
        order,
        required: true,
        config: Map::new(),
        dependencies: Vec::new(),
        timeout_ms: 0,
        retry_policy: RetryPolicy::default(),
        rollback_policy: RollbackPolicy::default(),
    }
}

pub fn step_after(id: &str, order: i64, dependencies: &[&str]) -> WorkflowStep {
    WorkflowStep {
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        ..step(id, order)
    }
}

pub fn retry_policy(max_retries: u32, initial_ms: u64, multiplier: f64, max_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_multiplier: multiplier,
        initial_delay_ms: initial_ms,
        max_delay_ms: max_ms,
    }
}

pub fn workflow(id: &str, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        name: format!("{id} workflow"),
        description: String::new(),
        steps,
        triggers: Vec::new(),
        conditions: Vec::new(),
        max_retries: 0,
        timeout_ms: 0,
        parallel: false,
        enabled: true,
    }
}

/// Scenario workflow: A, then B after A, then C after B.
pub fn chain_workflow(a_required: bool) -> WorkflowDefinition {
    let mut a = step("A", 1);
    a.required = a_required;
    workflow(
        "chain",
        vec![a, step_after("B", 2, &["A"]), step_after("C", 3, &["B"])],
    )
}

/// Temporary directory of agent directories backed by shell scripts.
pub struct AgentFixture {
    dir: TempDir,
}

impl AgentFixture {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create agent fixture dir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create `<root>/<name>` with `run.sh` holding `script` and a manifest
    /// launching it through `sh`.
    pub fn script_agent(&self, name: &str, script: &str) -> Result<PathBuf> {
        let dir = self.dir.path().join(name);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        fs::write(dir.join("run.sh"), script).context("write run.sh")?;
        fs::write(
            dir.join(MANIFEST_FILE),
            format!("name = \"{name}\"\ncommand = [\"sh\", \"run.sh\"]\n"),
        )
        .context("write manifest")?;
        Ok(dir)
    }

    /// Create `<root>/<name>` with no manifest.
    pub fn bare_agent(&self, name: &str) -> Result<PathBuf> {
        let dir = self.dir.path().join(name);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(dir)
    }
}
