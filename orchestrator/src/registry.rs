//! Agent registry with periodic health probes.
//!
//! Each agent with health checking enabled gets one probe thread that wakes on
//! the configured interval. Threads are stopped through a channel and joined,
//! so stopping never leaks a timer.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::agent::{
    Agent, AgentHealth, AgentStatistics, AgentStatus, CapabilityType, HealthStatus,
    PipelineState, agent_statistics, next_agent_status, pipeline_state,
};
use crate::io::probe::{HealthProbe, ProbeReport, SystemProbe};
use crate::lock;

struct RegistryState {
    agents: Mutex<BTreeMap<String, Agent>>,
    health: Mutex<BTreeMap<String, AgentHealth>>,
    probe: Arc<dyn HealthProbe>,
    started: Instant,
}

impl RegistryState {
    fn check(&self, agent_id: &str) -> Option<AgentHealth> {
        let agent = lock(&self.agents).get(agent_id).cloned()?;

        let started = Instant::now();
        let report = match self.probe.probe(&agent) {
            Ok(report) => report,
            Err(err) => {
                warn!(agent = %agent.id, err = %err, "health probe failed");
                ProbeReport::offline(err.to_string())
            }
        };
        let response_time_ms = started.elapsed().as_millis() as u64;
        let uptime_ms = match report.status {
            HealthStatus::Critical | HealthStatus::Offline => 0,
            HealthStatus::Healthy | HealthStatus::Warning => {
                self.started.elapsed().as_millis() as u64
            }
        };
        let snapshot = AgentHealth {
            agent_id: agent.id.clone(),
            status: report.status,
            last_check: Utc::now(),
            response_time_ms,
            error_rate: report.error_rate,
            uptime_ms,
            message: report.message,
        };

        {
            let mut agents = lock(&self.agents);
            // Unregistered while the probe ran.
            let current = agents.get_mut(agent_id)?;
            if let Some(next) = next_agent_status(current.status, snapshot.status) {
                match next {
                    AgentStatus::Error => {
                        warn!(agent = %agent_id, "agent is in critical health state");
                    }
                    _ => info!(agent = %agent_id, "agent recovered from error state"),
                }
                current.status = next;
            }
            lock(&self.health).insert(agent_id.to_string(), snapshot.clone());
        }
        debug!(agent = %agent_id, status = ?snapshot.status, response_time_ms, "health snapshot");
        Some(snapshot)
    }
}

struct ProbeTimer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProbeTimer {
    fn start(state: Arc<RegistryState>, agent_id: String, interval: Duration) -> Option<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let id = agent_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("probe-{agent_id}"))
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            state.check(&id);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(agent = %id, "probe timer stopped");
            });
        match spawned {
            Ok(handle) => Some(Self { stop, handle }),
            Err(err) => {
                warn!(agent = %agent_id, err = %err, "failed to start probe timer");
                None
            }
        }
    }

    fn stop(self) {
        // The thread may already have exited; either way it ends.
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("probe timer thread panicked");
        }
    }
}

/// Registry-side view of the pipeline status surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub status: PipelineState,
    pub agent_status: BTreeMap<String, AgentStatus>,
    #[serde(rename = "uptime")]
    pub uptime_ms: u64,
    pub registered_agents: usize,
}

/// Owns agent declarations, their latest health snapshots, and probe timers.
pub struct AgentRegistry {
    state: Arc<RegistryState>,
    timers: Mutex<HashMap<String, ProbeTimer>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SystemProbe))
    }

    pub fn with_probe(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            state: Arc::new(RegistryState {
                agents: Mutex::new(BTreeMap::new()),
                health: Mutex::new(BTreeMap::new()),
                probe,
                started: Instant::now(),
            }),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Store an agent, replacing any previous registration with the same id.
    #[instrument(skip_all, fields(agent = %agent.id))]
    pub fn register_agent(&self, agent: Agent) {
        let mut timers = lock(&self.timers);
        if let Some(previous) = timers.remove(&agent.id) {
            previous.stop();
        }
        let enabled = agent.health_check.enabled;
        let interval = agent.health_check.interval();
        let id = agent.id.clone();
        info!(name = %agent.name, capability = ?agent.capability, "registered agent");
        lock(&self.state.agents).insert(id.clone(), agent);

        if enabled
            && !interval.is_zero()
            && let Some(timer) = ProbeTimer::start(Arc::clone(&self.state), id.clone(), interval)
        {
            timers.insert(id, timer);
        }
    }

    /// Remove an agent, its snapshot, and its timer. Returns whether it existed.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        if let Some(timer) = lock(&self.timers).remove(agent_id) {
            timer.stop();
        }
        let removed = lock(&self.state.agents).remove(agent_id);
        lock(&self.state.health).remove(agent_id);
        match removed {
            Some(agent) => {
                info!(agent = %agent.id, "unregistered agent");
                true
            }
            None => false,
        }
    }

    /// Probe one agent now. Never fails; `None` only if the agent is unknown.
    pub fn perform_health_check(&self, agent_id: &str) -> Option<AgentHealth> {
        self.state.check(agent_id)
    }

    pub fn pipeline_state(&self) -> PipelineState {
        pipeline_state(lock(&self.state.health).values())
    }

    pub fn pipeline_status(&self) -> RegistryStatus {
        let agent_status = lock(&self.state.agents)
            .iter()
            .map(|(id, agent)| (id.clone(), agent.status))
            .collect::<BTreeMap<_, _>>();
        RegistryStatus {
            status: self.pipeline_state(),
            registered_agents: agent_status.len(),
            agent_status,
            uptime_ms: self.uptime().as_millis() as u64,
        }
    }

    pub fn agent_statistics(&self) -> AgentStatistics {
        let agents = lock(&self.state.agents);
        let health = lock(&self.state.health);
        agent_statistics(&agents, &health)
    }

    /// Stop every timer and start fresh ones for agents with checks enabled.
    pub fn restart_health_checks(&self) {
        self.stop_all_health_checks();
        let agents: Vec<(String, Duration)> = lock(&self.state.agents)
            .values()
            .filter(|a| a.health_check.enabled && !a.health_check.interval().is_zero())
            .map(|a| (a.id.clone(), a.health_check.interval()))
            .collect();
        let mut timers = lock(&self.timers);
        for (id, interval) in agents {
            if let Some(timer) = ProbeTimer::start(Arc::clone(&self.state), id.clone(), interval) {
                timers.insert(id, timer);
            }
        }
        info!(timers = timers.len(), "restarted agent health checks");
    }

    pub fn stop_all_health_checks(&self) {
        let drained: Vec<ProbeTimer> = lock(&self.timers).drain().map(|(_, t)| t).collect();
        let count = drained.len();
        for timer in drained {
            timer.stop();
        }
        if count > 0 {
            info!(count, "stopped agent health checks");
        }
    }

    /// Stop timers and forget every agent and snapshot.
    pub fn cleanup(&self) {
        self.stop_all_health_checks();
        lock(&self.state.agents).clear();
        lock(&self.state.health).clear();
    }

    pub fn active_timers(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        lock(&self.state.agents).get(agent_id).cloned()
    }

    pub fn agents(&self) -> Vec<Agent> {
        lock(&self.state.agents).values().cloned().collect()
    }

    pub fn agents_by_capability(&self, capability: CapabilityType) -> Vec<Agent> {
        lock(&self.state.agents)
            .values()
            .filter(|a| a.capability == capability)
            .cloned()
            .collect()
    }

    pub fn agent_health(&self, agent_id: &str) -> Option<AgentHealth> {
        lock(&self.state.health).get(agent_id).cloned()
    }

    pub fn all_agent_health(&self) -> Vec<AgentHealth> {
        lock(&self.state.health).values().cloned().collect()
    }

    pub fn uptime(&self) -> Duration {
        self.state.started.elapsed()
    }
}

impl Drop for AgentRegistry {
    fn drop(&mut self) {
        self.stop_all_health_checks();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::core::agent::HealthCheckPolicy;
    use crate::error::AgentError;

    struct FixedProbe(HealthStatus);

    impl HealthProbe for FixedProbe {
        fn probe(&self, _agent: &Agent) -> Result<ProbeReport, AgentError> {
            Ok(match self.0 {
                HealthStatus::Healthy => ProbeReport::healthy(),
                HealthStatus::Warning => ProbeReport::warning(0.3, "slow"),
                HealthStatus::Critical => ProbeReport::critical("down"),
                HealthStatus::Offline => ProbeReport::offline("gone"),
            })
        }
    }

    struct BrokenProbe;

    impl HealthProbe for BrokenProbe {
        fn probe(&self, _agent: &Agent) -> Result<ProbeReport, AgentError> {
            Err(AgentError::health("probe exploded"))
        }
    }

    fn agent(id: &str, status: AgentStatus) -> Agent {
        Agent {
            id: id.to_string(),
            name: id.to_string(),
            capability: CapabilityType::AutoFix,
            status,
            path: PathBuf::from("/nonexistent"),
            dependencies: Vec::new(),
            config: Default::default(),
            health_check: HealthCheckPolicy::default(),
        }
    }

    #[test]
    fn critical_probe_demotes_agent() {
        let registry = AgentRegistry::with_probe(Arc::new(FixedProbe(HealthStatus::Critical)));
        registry.register_agent(agent("a", AgentStatus::Active));
        let health = registry.perform_health_check("a").expect("snapshot");
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.uptime_ms, 0);
        assert_eq!(registry.agent("a").expect("agent").status, AgentStatus::Error);
        assert_eq!(registry.pipeline_state(), PipelineState::Error);
    }

    #[test]
    fn healthy_probe_recovers_error_agent() {
        let registry = AgentRegistry::with_probe(Arc::new(FixedProbe(HealthStatus::Healthy)));
        registry.register_agent(agent("a", AgentStatus::Error));
        registry.perform_health_check("a");
        assert_eq!(registry.agent("a").expect("agent").status, AgentStatus::Active);
        assert_eq!(registry.pipeline_state(), PipelineState::Running);
    }

    #[test]
    fn broken_probe_records_offline() {
        let registry = AgentRegistry::with_probe(Arc::new(BrokenProbe));
        registry.register_agent(agent("a", AgentStatus::Active));
        let health = registry.perform_health_check("a").expect("snapshot");
        assert_eq!(health.status, HealthStatus::Offline);
        assert_eq!(health.error_rate, 1.0);
        assert_eq!(registry.agent("a").expect("agent").status, AgentStatus::Active);
    }

    #[test]
    fn unknown_agent_has_no_snapshot() {
        let registry = AgentRegistry::with_probe(Arc::new(FixedProbe(HealthStatus::Healthy)));
        assert!(registry.perform_health_check("ghost").is_none());
        assert!(!registry.unregister_agent("ghost"));
    }

    #[test]
    fn unregister_removes_agent_and_snapshot() {
        let registry = AgentRegistry::with_probe(Arc::new(FixedProbe(HealthStatus::Warning)));
        registry.register_agent(agent("a", AgentStatus::Active));
        registry.perform_health_check("a");
        assert!(registry.unregister_agent("a"));
        assert!(registry.agent("a").is_none());
        assert!(registry.agent_health("a").is_none());
    }

    #[test]
    fn timers_follow_registration_lifecycle() {
        let registry = AgentRegistry::with_probe(Arc::new(FixedProbe(HealthStatus::Healthy)));
        let mut probed = agent("a", AgentStatus::Active);
        probed.health_check.enabled = true;
        probed.health_check.interval_ms = 10;
        registry.register_agent(probed.clone());
        registry.register_agent(probed);
        registry.register_agent(agent("b", AgentStatus::Active));
        assert_eq!(registry.active_timers(), 1);

        registry.restart_health_checks();
        registry.restart_health_checks();
        assert_eq!(registry.active_timers(), 1);

        registry.stop_all_health_checks();
        registry.stop_all_health_checks();
        assert_eq!(registry.active_timers(), 0);

        registry.cleanup();
        assert!(registry.agents().is_empty());
    }

    #[test]
    fn statistics_count_status_and_health() {
        let registry = AgentRegistry::with_probe(Arc::new(FixedProbe(HealthStatus::Warning)));
        registry.register_agent(agent("a", AgentStatus::Active));
        registry.register_agent(agent("b", AgentStatus::Inactive));
        registry.perform_health_check("a");
        let stats = registry.agent_statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.inactive, 1);
        assert_eq!(stats.warning, 1);
        assert_eq!(registry.pipeline_state(), PipelineState::Idle);
    }
}
