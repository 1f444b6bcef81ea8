//! Agent declarations, health snapshots, and the status transition rule.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Capability an agent provides to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityType {
    TestGenerator,
    QualityAnalyzer,
    AutoFix,
    PipelineOrchestrator,
}

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Error,
}

impl AgentStatus {
    pub fn label(self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Error => "error",
        }
    }
}

/// How (and whether) an agent is probed for liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckPolicy {
    pub enabled: bool,
    /// Milliseconds between probes.
    #[serde(rename = "interval")]
    pub interval_ms: u64,
    /// Hard limit for a single probe in milliseconds.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    /// Extra responsiveness attempts before a probe settles on `warning`.
    pub retries: u32,
    /// Remote endpoint; when set, the endpoint strategy replaces the process probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            retries: 0,
            endpoint: None,
        }
    }
}

impl HealthCheckPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Declarative configuration of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub capability: CapabilityType,
    #[serde(default)]
    pub status: AgentStatus,
    /// Directory holding the agent's manifest and entry point.
    pub path: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub health_check: HealthCheckPolicy,
}

/// Probe verdict for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Offline,
}

/// Latest probe snapshot for an agent. Overwritten on every probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    #[serde(rename = "responseTime")]
    pub response_time_ms: u64,
    /// Fraction in `[0, 1]`.
    pub error_rate: f64,
    #[serde(rename = "uptime")]
    pub uptime_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Status an agent should move to after a probe, if any.
///
/// A `critical` probe demotes any non-error agent to `error`; a `healthy`
/// probe promotes an `error` agent back to `active`. Nothing else changes
/// agent status automatically.
pub fn next_agent_status(current: AgentStatus, health: HealthStatus) -> Option<AgentStatus> {
    match (current, health) {
        (AgentStatus::Error, HealthStatus::Healthy) => Some(AgentStatus::Active),
        (AgentStatus::Active | AgentStatus::Inactive, HealthStatus::Critical) => {
            Some(AgentStatus::Error)
        }
        _ => None,
    }
}

/// Overall pipeline state reported on the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Running,
    Idle,
    Error,
    Maintenance,
}

/// `error` if any snapshot is critical, `idle` if none is healthy, else `running`.
pub fn pipeline_state<'a, I>(snapshots: I) -> PipelineState
where
    I: IntoIterator<Item = &'a AgentHealth>,
{
    let mut healthy = 0usize;
    for health in snapshots {
        match health.status {
            HealthStatus::Critical => return PipelineState::Error,
            HealthStatus::Healthy => healthy += 1,
            HealthStatus::Warning | HealthStatus::Offline => {}
        }
    }
    if healthy == 0 {
        PipelineState::Idle
    } else {
        PipelineState::Running
    }
}

/// Counts of agents by status and snapshots by health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatistics {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub offline: usize,
}

pub fn agent_statistics(
    agents: &BTreeMap<String, Agent>,
    health: &BTreeMap<String, AgentHealth>,
) -> AgentStatistics {
    let mut stats = AgentStatistics {
        total: agents.len(),
        ..AgentStatistics::default()
    };
    for agent in agents.values() {
        match agent.status {
            AgentStatus::Active => stats.active += 1,
            AgentStatus::Inactive => stats.inactive += 1,
            AgentStatus::Error => stats.error += 1,
        }
    }
    for snapshot in health.values() {
        match snapshot.status {
            HealthStatus::Healthy => stats.healthy += 1,
            HealthStatus::Warning => stats.warning += 1,
            HealthStatus::Critical => stats.critical += 1,
            HealthStatus::Offline => stats.offline += 1,
        }
    }
    stats
}
