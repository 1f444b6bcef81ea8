//! Top-level driver: configuration, agent registration, the two-iteration
//! improvement loop, and the status/metrics surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::agent::{Agent, AgentHealth, AgentStatistics, AgentStatus, PipelineState};
use crate::core::analytics::{
    IterationAnalytics, IterationRecord, RiskAssessment, TrendComparison, analyze, assess_risk,
    compare,
};
use crate::core::execution::{ExecutionStatus, OverallStatus, PipelineExecution, RiskLevel};
use crate::core::gates::{GateAction, GateOutcome, evaluate_conditions, evaluate_quality_gates};
use crate::core::report::{FinalReport, ImprovementSummary};
use crate::core::workflow::{Priority, WorkflowDefinition, WorkflowExecutionRequest};
use crate::engine::{EngineSettings, QueuedRequest, Sleeper, WorkflowEngine};
use crate::error::CoordinatorError;
use crate::io::config::{NotificationType, PipelineConfig, load_config, write_config};
use crate::io::executor::{AgentExecutor, ProcessExecutor};
use crate::lock;
use crate::registry::AgentRegistry;

/// Every `execute_workflow` call runs the workflow this many times.
pub const IMPROVEMENT_ITERATIONS: u32 = 2;

const REQUESTED_BY: &str = "pipeline-orchestrator";
const DEFAULT_VERSION: &str = "1.0.0";

pub const EVENT_WORKFLOW_COMPLETED: &str = "workflow-completed";
pub const EVENT_WORKFLOW_FAILED: &str = "workflow-failed";
pub const EVENT_GATE_FAILED: &str = "quality-gate-failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub status: PipelineState,
    pub agent_status: BTreeMap<String, AgentStatus>,
    pub active_workflows: usize,
    pub queued_workflows: usize,
    pub last_activity: DateTime<Utc>,
    #[serde(rename = "uptime")]
    pub uptime_ms: u64,
    pub registered_agents: usize,
    pub total_iterations: usize,
    pub last_execution: Option<IterationRecord>,
}

/// One point of the quality trend series, taken from an iteration record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTrendPoint {
    pub date: DateTime<Utc>,
    pub quality_score: f64,
    pub test_coverage: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    #[serde(rename = "averageExecutionTime")]
    pub average_execution_time_ms: f64,
    pub average_success_rate: f64,
    /// Last iteration compared with the one before it.
    pub improvement_trend: Option<TrendComparison>,
    pub active_workflows: usize,
    pub agent_statistics: AgentStatistics,
    pub agent_health: Vec<AgentHealth>,
    pub quality_trends: Vec<QualityTrendPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    #[serde(rename = "uptime")]
    pub uptime_ms: u64,
    pub start_time: DateTime<Utc>,
    pub version: String,
    pub status: PipelineState,
}

/// Execution counts and averages over iteration history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryTotals {
    /// Iterations the engine actually ran.
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub average_execution_time_ms: f64,
    pub average_success_rate: f64,
}

/// Aggregate the status surface from iteration history. Pure.
pub fn metrics_from_history(history: &[IterationRecord]) -> HistoryTotals {
    let ran: Vec<&IterationRecord> = history.iter().filter(|r| r.execution_id.is_some()).collect();
    let failed_executions = history
        .iter()
        .filter(|r| r.status == ExecutionStatus::Failed)
        .count();
    if ran.is_empty() {
        return HistoryTotals {
            failed_executions,
            ..HistoryTotals::default()
        };
    }
    let total = ran.len() as f64;
    HistoryTotals {
        total_executions: ran.len(),
        successful_executions: ran
            .iter()
            .filter(|r| r.overall_status == OverallStatus::Success)
            .count(),
        failed_executions,
        average_execution_time_ms: ran.iter().map(|r| r.duration_ms as f64).sum::<f64>() / total,
        average_success_rate: ran.iter().map(|r| r.success_rate).sum::<f64>() / total,
    }
}

pub struct PipelineCoordinator<E: AgentExecutor = ProcessExecutor> {
    engine: WorkflowEngine<E>,
    config: Mutex<Option<PipelineConfig>>,
    config_path: Mutex<Option<PathBuf>>,
    history: Mutex<Vec<IterationRecord>>,
    last_activity: Mutex<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    started: Instant,
    shut_down: AtomicBool,
}

impl PipelineCoordinator<ProcessExecutor> {
    /// Coordinator wired to real agent processes and system probes.
    pub fn system() -> Self {
        Self::new(ProcessExecutor::default(), Arc::new(AgentRegistry::new()))
    }
}

impl<E: AgentExecutor> PipelineCoordinator<E> {
    pub fn new(executor: E, registry: Arc<AgentRegistry>) -> Self {
        let now = Utc::now();
        Self {
            engine: WorkflowEngine::new(executor, registry, EngineSettings::default()),
            config: Mutex::new(None),
            config_path: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            last_activity: Mutex::new(now),
            started_at: now,
            started: Instant::now(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.engine.set_sleeper(sleeper);
        self
    }

    pub fn engine(&self) -> &WorkflowEngine<E> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        self.engine.registry()
    }

    fn ensure_running(&self) -> Result<(), CoordinatorError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(CoordinatorError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Utc::now();
    }

    /// Load the configuration at `path` (or an empty default) and register
    /// every agent it declares. Re-initializing replaces the previous roster.
    #[instrument(skip_all)]
    pub fn initialize(&self, path: Option<&Path>) -> Result<(), CoordinatorError> {
        self.ensure_running()?;
        let cfg = match path {
            Some(path) => load_config(path)?,
            None => {
                info!("no configuration path given, using empty default");
                PipelineConfig::default()
            }
        };
        self.install(cfg, path.map(Path::to_path_buf));
        Ok(())
    }

    /// Initialize from an already-built configuration.
    pub fn initialize_with(&self, cfg: PipelineConfig) -> Result<(), CoordinatorError> {
        self.ensure_running()?;
        cfg.validate()?;
        self.install(cfg, None);
        Ok(())
    }

    fn install(&self, cfg: PipelineConfig, path: Option<PathBuf>) {
        let registry = self.registry();
        registry.cleanup();
        for agent in &cfg.agents {
            registry.register_agent(agent.clone());
        }
        self.engine.apply_settings(EngineSettings::from_config(&cfg));
        let enabled = cfg.workflows.iter().filter(|w| w.enabled).count();
        for workflow in cfg.workflows.iter().filter(|w| w.enabled) {
            debug!(workflow = %workflow.id, name = %workflow.name, "workflow available");
        }
        info!(
            pipeline = %cfg.id,
            agents = cfg.agents.len(),
            workflows = enabled,
            "pipeline initialized"
        );
        *lock(&self.config) = Some(cfg);
        *lock(&self.config_path) = path;
        self.touch();
    }

    /// Run a workflow for the fixed number of improvement iterations and
    /// build the final report from the last one.
    #[instrument(skip(self, config))]
    pub fn execute_workflow(
        &self,
        workflow_id: &str,
        config: Map<String, Value>,
        priority: Priority,
    ) -> Result<FinalReport, CoordinatorError> {
        self.ensure_running()?;
        let cfg = lock(&self.config)
            .clone()
            .ok_or(CoordinatorError::NotInitialized)?;
        let workflow = cfg
            .workflow(workflow_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::WorkflowNotFound(workflow_id.to_string()))?;
        if !workflow.enabled {
            return Err(CoordinatorError::WorkflowDisabled(workflow_id.to_string()));
        }
        info!(name = %workflow.name, %priority, "executing workflow");

        let started = Instant::now();
        let mut records = Vec::new();
        let mut last_execution = None;
        for iteration in 1..=IMPROVEMENT_ITERATIONS {
            if iteration > 1 && self.is_shut_down() {
                info!(iteration, "pipeline shut down, skipping remaining iterations");
                break;
            }
            let request = self.request(&workflow, &config, priority, iteration);
            let record = match self.engine.execute_workflow(&workflow, &request) {
                Ok(execution) => {
                    let record = IterationRecord::from_execution(iteration, &execution);
                    last_execution = Some(execution);
                    record
                }
                Err(err) => {
                    warn!(iteration, err = %err, "iteration refused by engine");
                    last_execution = None;
                    IterationRecord::failed(iteration, &workflow.id, err.to_string())
                }
            };
            lock(&self.history).push(record.clone());
            records.push(record);
            self.touch();
        }

        let report = self.final_report(
            &cfg,
            &workflow,
            last_execution,
            records,
            started.elapsed().as_millis() as u64,
        );
        self.notify_outcome(&cfg, &report);
        Ok(report)
    }

    fn request(
        &self,
        workflow: &WorkflowDefinition,
        config: &Map<String, Value>,
        priority: Priority,
        iteration: u32,
    ) -> WorkflowExecutionRequest {
        let mut metadata = Map::new();
        metadata.insert(
            "requestedAt".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        metadata.insert(
            "requestedBy".to_string(),
            Value::String(REQUESTED_BY.to_string()),
        );
        metadata.insert("iteration".to_string(), Value::from(iteration));
        WorkflowExecutionRequest {
            workflow_id: workflow.id.clone(),
            config: config.clone(),
            priority,
            timeout_ms: None,
            metadata,
        }
    }

    fn final_report(
        &self,
        cfg: &PipelineConfig,
        workflow: &WorkflowDefinition,
        execution: Option<PipelineExecution>,
        records: Vec<IterationRecord>,
        total_time_ms: u64,
    ) -> FinalReport {
        let (first, last) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first.clone(), last.clone()),
            _ => {
                let missing = IterationRecord::failed(0, &workflow.id, "no iterations ran");
                (missing.clone(), missing)
            }
        };
        let analytics: Option<IterationAnalytics> = execution.as_ref().map(analyze);
        let risk = match (&execution, &analytics) {
            (Some(exec), Some(analytics)) => assess_risk(exec.duration_ms.unwrap_or(0), analytics),
            _ => RiskAssessment {
                overall: RiskLevel::Low,
                findings: Vec::new(),
            },
        };
        let quality_gates: Vec<GateOutcome> = match &execution {
            Some(exec) => {
                let duration = exec.duration_ms.unwrap_or(0);
                let mut outcomes =
                    evaluate_quality_gates(&cfg.settings.quality_gates, &exec.results, duration);
                outcomes.extend(evaluate_conditions(&workflow.conditions, &exec.results));
                outcomes
            }
            None => Vec::new(),
        };
        for outcome in quality_gates.iter().filter(|o| !o.passed) {
            warn!(gate = %outcome.id, action = ?outcome.action, "{}", outcome.message);
        }
        let blocked = quality_gates.iter().any(GateOutcome::blocks);
        let summary = match (&execution, &last.error) {
            (Some(exec), _) => exec.results.summary.clone(),
            (None, Some(err)) => format!("Workflow execution failed: {err}"),
            (None, None) => "Workflow execution failed".to_string(),
        };

        FinalReport {
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            trend: compare(&first, &last),
            improvement: ImprovementSummary::between(&first, &last, records.len() as u32),
            execution,
            analytics,
            iteration_history: records,
            risk,
            quality_gates,
            blocked,
            total_time_ms,
            summary,
        }
    }

    fn notify_outcome(&self, cfg: &PipelineConfig, report: &FinalReport) {
        let event = match report.overall_status() {
            OverallStatus::Failure => EVENT_WORKFLOW_FAILED,
            OverallStatus::Success | OverallStatus::Partial => EVENT_WORKFLOW_COMPLETED,
        };
        self.notify(cfg, event, &report.summary);
        for outcome in &report.quality_gates {
            if !outcome.passed && outcome.action == GateAction::Notify {
                self.notify(cfg, EVENT_GATE_FAILED, &outcome.message);
            }
        }
    }

    fn notify(&self, cfg: &PipelineConfig, event: &str, message: &str) {
        if !cfg.settings.enable_notifications {
            return;
        }
        let channels = cfg.settings.notifications.iter().filter(|c| {
            c.enabled && (c.events.is_empty() || c.events.iter().any(|e| e == event))
        });
        for channel in channels {
            match channel.kind {
                NotificationType::Console => info!(event, "{message}"),
                other => debug!(event, channel = ?other, "no transport for notification channel"),
            }
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let registry = self.registry().pipeline_status();
        let history = lock(&self.history);
        let status = if self.shut_down.load(Ordering::SeqCst) {
            PipelineState::Maintenance
        } else {
            registry.status
        };
        PipelineStatus {
            status,
            agent_status: registry.agent_status,
            active_workflows: self.engine.active_count(),
            queued_workflows: self.engine.queued_requests().len(),
            last_activity: *lock(&self.last_activity),
            uptime_ms: self.uptime_ms(),
            registered_agents: registry.registered_agents,
            total_iterations: history.len(),
            last_execution: history.last().cloned(),
        }
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let history = lock(&self.history).clone();
        let totals = metrics_from_history(&history);
        let improvement_trend = match history.as_slice() {
            [.., previous, last] => Some(compare(previous, last)),
            _ => None,
        };
        let quality_trends = history
            .iter()
            .filter(|r| r.execution_id.is_some())
            .map(|r| QualityTrendPoint {
                date: r.started_at,
                quality_score: r.quality_score,
                test_coverage: r.test_coverage,
                risk_level: r.risk_level,
            })
            .collect();
        PipelineMetrics {
            total_executions: totals.total_executions,
            successful_executions: totals.successful_executions,
            failed_executions: totals.failed_executions,
            average_execution_time_ms: totals.average_execution_time_ms,
            average_success_rate: totals.average_success_rate,
            improvement_trend,
            active_workflows: self.engine.active_count(),
            agent_statistics: self.registry().agent_statistics(),
            agent_health: self.registry().all_agent_health(),
            quality_trends,
        }
    }

    pub fn iteration_history(&self) -> Vec<IterationRecord> {
        lock(&self.history).clone()
    }

    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        self.engine.cancel_execution(execution_id)
    }

    pub fn active_executions(&self) -> Vec<PipelineExecution> {
        self.engine.active_executions()
    }

    pub fn queued_requests(&self) -> Vec<QueuedRequest> {
        self.engine.queued_requests()
    }

    /// Enabled workflows only.
    pub fn workflows(&self) -> Vec<WorkflowDefinition> {
        lock(&self.config)
            .as_ref()
            .map(|cfg| cfg.workflows.iter().filter(|w| w.enabled).cloned().collect())
            .unwrap_or_default()
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        lock(&self.config).as_ref()?.workflow(workflow_id).cloned()
    }

    pub fn config(&self) -> Option<PipelineConfig> {
        lock(&self.config).clone()
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.registry().agents()
    }

    pub fn agent_health(&self, agent_id: &str) -> Option<AgentHealth> {
        self.registry().agent_health(agent_id)
    }

    /// Probe every registered agent once, now.
    pub fn check_agents(&self) -> Vec<AgentHealth> {
        let registry = self.registry();
        registry
            .agents()
            .iter()
            .filter_map(|agent| registry.perform_health_check(&agent.id))
            .collect()
    }

    pub fn restart_health_checks(&self) {
        self.registry().restart_health_checks();
    }

    /// Apply `update` to the current configuration, validate it, re-register
    /// agents, and persist it when it was loaded from a file.
    pub fn update_configuration<F>(&self, update: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(&mut PipelineConfig),
    {
        self.ensure_running()?;
        let mut cfg = lock(&self.config)
            .clone()
            .ok_or(CoordinatorError::NotInitialized)?;
        update(&mut cfg);
        cfg.updated_at = Some(Utc::now());
        cfg.validate()?;
        let path = lock(&self.config_path).clone();
        if let Some(path) = &path {
            write_config(path, &cfg).map_err(CoordinatorError::Save)?;
        }
        self.install(cfg, path);
        info!("configuration updated");
        Ok(())
    }

    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn runtime_info(&self) -> RuntimeInfo {
        let version = lock(&self.config)
            .as_ref()
            .map(|cfg| cfg.version.clone())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        RuntimeInfo {
            uptime_ms: self.uptime_ms(),
            start_time: self.started_at,
            version,
            status: self.status().status,
        }
    }

    /// Stop probes, close the engine to queued and new requests, cancel
    /// active executions, and clear the registry. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down pipeline");
        let registry = self.registry();
        registry.stop_all_health_checks();
        self.engine.close();
        for execution in self.engine.active_executions() {
            self.engine.cancel_execution(&execution.id);
        }
        registry.cleanup();
        info!("pipeline shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl<E: AgentExecutor> Drop for PipelineCoordinator<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: u32, duration_ms: u64, rate: f64, overall: OverallStatus) -> IterationRecord {
        IterationRecord {
            iteration,
            workflow_id: "wf".to_string(),
            execution_id: Some(format!("exec-{iteration}")),
            status: if overall == OverallStatus::Failure {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            },
            overall_status: overall,
            started_at: Utc::now(),
            duration_ms,
            success_rate: rate,
            quality_score: 0.0,
            test_coverage: 0.0,
            risk_level: RiskLevel::Low,
            error: None,
        }
    }

    #[test]
    fn metrics_average_only_iterations_that_ran() {
        let history = vec![
            record(1, 100, 50.0, OverallStatus::Partial),
            record(2, 300, 100.0, OverallStatus::Success),
            IterationRecord::failed(3, "wf", "invalid workflow"),
        ];
        let totals = metrics_from_history(&history);
        assert_eq!(totals.total_executions, 2);
        assert_eq!(totals.successful_executions, 1);
        assert_eq!(totals.failed_executions, 1);
        assert!((totals.average_execution_time_ms - 200.0).abs() < f64::EPSILON);
        assert!((totals.average_success_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn metrics_of_empty_history_are_zero() {
        assert_eq!(metrics_from_history(&[]), HistoryTotals::default());
    }

    #[test]
    fn uninitialized_coordinator_refuses_to_execute() {
        let coordinator = PipelineCoordinator::new(
            ProcessExecutor::default(),
            Arc::new(AgentRegistry::new()),
        );
        let err = coordinator
            .execute_workflow("anything", Map::new(), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotInitialized));
        assert!(coordinator.workflows().is_empty());
        assert_eq!(coordinator.runtime_info().version, "1.0.0");
    }

    #[test]
    fn shutdown_is_idempotent_and_reports_maintenance() {
        let coordinator = PipelineCoordinator::new(
            ProcessExecutor::default(),
            Arc::new(AgentRegistry::new()),
        );
        coordinator.initialize(None).unwrap();
        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shut_down());
        assert_eq!(coordinator.status().status, PipelineState::Maintenance);
        assert!(matches!(
            coordinator.initialize(None),
            Err(CoordinatorError::ShutDown)
        ));
    }
}
