//! Workflow execution engine.
//!
//! Runs the steps of one workflow strictly sequentially on the caller's
//! thread. Concurrency across workflows is bounded by
//! `max_concurrent_workflows`; callers over the limit wait in a FIFO queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::execution::{ExecutionStatus, PipelineExecution, StepStatus};
use crate::core::results::build_results;
use crate::core::workflow::{
    Priority, WorkflowDefinition, WorkflowExecutionRequest, WorkflowStep, execution_order,
    validate_workflow,
};
use crate::error::{AgentError, EngineError};
use crate::io::artifacts::collect_artifacts;
use crate::io::config::PipelineConfig;
use crate::io::executor::{AgentExecutor, AgentInvocation, ProcessExecutor, resolve_agent_path};
use crate::lock;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub pipeline_id: String,
    pub max_concurrent_workflows: usize,
    /// Used for steps that declare no timeout.
    pub default_step_timeout: Duration,
    /// How often a queued request re-checks for a free slot.
    pub queue_poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pipeline_id: "default-pipeline".to_string(),
            max_concurrent_workflows: 3,
            default_step_timeout: Duration::from_secs(5 * 60),
            queue_poll_interval: Duration::from_millis(50),
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            pipeline_id: cfg.id.clone(),
            max_concurrent_workflows: cfg.settings.max_concurrent_workflows,
            default_step_timeout: Duration::from_millis(cfg.settings.default_timeout_ms),
            ..Self::default()
        }
    }
}

/// Blocks the current workflow between retries.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A request waiting for a free execution slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    #[serde(skip)]
    ticket: u64,
    pub execution_id: String,
    pub workflow_id: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

type SharedExecution = Arc<Mutex<PipelineExecution>>;
type ActiveTable = Mutex<BTreeMap<String, SharedExecution>>;

/// Removes an execution from the active table when the run ends, however it ends.
struct ActiveSlot<'a> {
    table: &'a ActiveTable,
    id: String,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        lock(self.table).remove(&self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Completed,
    Failed,
    Cancelled,
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `exec-<unix millis>-<9 random base36 chars>`.
pub fn new_execution_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect();
    format!("exec-{}-{suffix}", Utc::now().timestamp_millis())
}

/// Timeout for the next attempt of a step, or `None` when the workflow
/// budget is already spent.
pub fn effective_step_timeout(
    step_timeout: Duration,
    default_timeout: Duration,
    request_cap: Option<Duration>,
    remaining_budget: Option<Duration>,
) -> Option<Duration> {
    let mut timeout = if step_timeout.is_zero() {
        default_timeout
    } else {
        step_timeout
    };
    if let Some(cap) = request_cap.filter(|c| !c.is_zero()) {
        timeout = timeout.min(cap);
    }
    match remaining_budget {
        Some(remaining) if remaining.is_zero() => None,
        Some(remaining) => Some(timeout.min(remaining)),
        None => Some(timeout),
    }
}

pub struct WorkflowEngine<E: AgentExecutor = ProcessExecutor> {
    executor: E,
    registry: Arc<AgentRegistry>,
    sleeper: Arc<dyn Sleeper>,
    settings: Mutex<EngineSettings>,
    active: ActiveTable,
    queue: Mutex<VecDeque<QueuedRequest>>,
    next_ticket: AtomicU64,
    closed: AtomicBool,
}

impl<E: AgentExecutor> WorkflowEngine<E> {
    pub fn new(executor: E, registry: Arc<AgentRegistry>, settings: EngineSettings) -> Self {
        Self {
            executor,
            registry,
            sleeper: Arc::new(ThreadSleeper),
            settings: Mutex::new(settings),
            active: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(VecDeque::new()),
            next_ticket: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.set_sleeper(sleeper);
        self
    }

    pub(crate) fn set_sleeper(&mut self, sleeper: Arc<dyn Sleeper>) {
        self.sleeper = sleeper;
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> EngineSettings {
        lock(&self.settings).clone()
    }

    pub fn apply_settings(&self, settings: EngineSettings) {
        *lock(&self.settings) = settings;
    }

    /// Run a workflow to a terminal state and return the record.
    ///
    /// Step failures never surface as `Err`; they are recorded on the
    /// execution. `Err` means the workflow was rejected before it started.
    #[instrument(skip_all, fields(workflow = %workflow.id))]
    pub fn execute_workflow(
        &self,
        workflow: &WorkflowDefinition,
        request: &WorkflowExecutionRequest,
    ) -> Result<PipelineExecution, EngineError> {
        let errors = validate_workflow(workflow);
        if !errors.is_empty() {
            warn!(count = errors.len(), "rejecting invalid workflow");
            return Err(EngineError::InvalidWorkflow {
                workflow_id: workflow.id.clone(),
                errors,
            });
        }
        if workflow.parallel {
            debug!("parallel flag set; steps still run sequentially");
        }

        let settings = self.settings();
        let mut metadata = request.metadata.clone();
        metadata.insert("config".to_string(), Value::Object(request.config.clone()));
        metadata.insert(
            "priority".to_string(),
            Value::String(request.priority.to_string()),
        );
        let id = new_execution_id();
        let shared: SharedExecution = Arc::new(Mutex::new(PipelineExecution::new(
            id.clone(),
            settings.pipeline_id.clone(),
            workflow,
            metadata,
        )));

        let _slot = self.admit(&shared, &id, workflow, request.priority, &settings)?;
        {
            let mut exec = lock(&shared);
            exec.started_at = Utc::now();
            exec.transition(ExecutionStatus::Running);
        }
        info!(execution = %id, steps = workflow.steps.len(), "workflow started");

        let deadline = (workflow.timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(workflow.timeout_ms));
        let mut aborted = false;
        for step in execution_order(&workflow.steps) {
            if lock(&shared).status == ExecutionStatus::Cancelled {
                break;
            }
            let unmet = lock(&shared).unmet_dependencies(&step.dependencies);
            if !unmet.is_empty() {
                self.skip_step(&shared, step, &unmet);
                continue;
            }
            match self.run_step(&shared, workflow, step, request, deadline, &settings) {
                StepOutcome::Completed | StepOutcome::Cancelled => {}
                StepOutcome::Failed if step.required => {
                    warn!(step = %step.id, "required step failed, aborting workflow");
                    aborted = true;
                    break;
                }
                StepOutcome::Failed => {
                    debug!(step = %step.id, "optional step failed, continuing");
                }
            }
        }

        let mut exec = lock(&shared);
        if exec.status == ExecutionStatus::Running {
            let next = if aborted {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };
            exec.transition(next);
        }
        exec.finish_clock(Utc::now());
        let artifacts = collect_artifacts(&exec);
        exec.results = build_results(&exec, artifacts);
        info!(
            execution = %id,
            status = exec.status.label(),
            duration_ms = exec.duration_ms.unwrap_or(0),
            "workflow finished"
        );
        Ok(exec.clone())
    }

    /// Take a slot in the active table, waiting in FIFO order when full.
    /// Fails once the engine is closed, including while queued.
    fn admit(
        &self,
        shared: &SharedExecution,
        id: &str,
        workflow: &WorkflowDefinition,
        priority: Priority,
        settings: &EngineSettings,
    ) -> Result<ActiveSlot<'_>, EngineError> {
        let max = settings.max_concurrent_workflows.max(1);
        let slot = || ActiveSlot {
            table: &self.active,
            id: id.to_string(),
        };
        let closed = || EngineError::Closed {
            workflow_id: workflow.id.clone(),
        };
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = lock(&self.queue);
            let mut active = lock(&self.active);
            if self.is_closed() {
                return Err(closed());
            }
            if queue.is_empty() && active.len() < max {
                active.insert(id.to_string(), Arc::clone(shared));
                return Ok(slot());
            }
            queue.push_back(QueuedRequest {
                ticket,
                execution_id: id.to_string(),
                workflow_id: workflow.id.clone(),
                priority,
                enqueued_at: Utc::now(),
            });
            info!(execution = %id, position = queue.len(), "workflow queued");
        }
        loop {
            thread::sleep(settings.queue_poll_interval);
            let mut queue = lock(&self.queue);
            if self.is_closed() {
                queue.retain(|q| q.ticket != ticket);
                info!(execution = %id, "engine closed, dropping queued workflow");
                return Err(closed());
            }
            let mut active = lock(&self.active);
            let at_head = queue.front().is_some_and(|q| q.ticket == ticket);
            if at_head && active.len() < max {
                queue.pop_front();
                active.insert(id.to_string(), Arc::clone(shared));
                debug!(execution = %id, "workflow dequeued");
                return Ok(slot());
            }
        }
    }

    fn skip_step(&self, shared: &SharedExecution, step: &WorkflowStep, unmet: &[String]) {
        info!(step = %step.id, unmet = ?unmet, "skipping step, dependencies not met");
        let mut exec = lock(shared);
        if let Some(record) = exec.step_mut(&step.id) {
            record.status = StepStatus::Skipped;
            record.skip_reason = Some("dependencies not met".to_string());
            record.error = Some(AgentError::dependencies_not_met(unmet));
        }
    }

    fn run_step(
        &self,
        shared: &SharedExecution,
        workflow: &WorkflowDefinition,
        step: &WorkflowStep,
        request: &WorkflowExecutionRequest,
        deadline: Option<Instant>,
        settings: &EngineSettings,
    ) -> StepOutcome {
        let policy = &step.retry_policy;
        let execution_id = lock(shared).id.clone();
        let registered = self.registry.agent(&step.agent_id).map(|a| a.path);
        let mut config: Map<String, Value> = step.config.clone();
        config.extend(request.config.clone());
        let agent_path = resolve_agent_path(&config, registered.as_deref(), &step.agent_id);

        loop {
            let timeout = effective_step_timeout(
                Duration::from_millis(step.timeout_ms),
                settings.default_step_timeout,
                request.timeout_ms.map(Duration::from_millis),
                deadline.map(|d| d.saturating_duration_since(Instant::now())),
            );

            {
                let mut exec = lock(shared);
                let Some(record) = exec.step_mut(&step.id) else {
                    return StepOutcome::Failed;
                };
                record.status = StepStatus::Running;
                if record.started_at.is_none() {
                    record.started_at = Some(Utc::now());
                }
            }

            let result = match timeout {
                Some(timeout) => {
                    let invocation = AgentInvocation {
                        execution_id: execution_id.clone(),
                        workflow_id: workflow.id.clone(),
                        step_id: step.id.clone(),
                        agent_id: step.agent_id.clone(),
                        agent_path: agent_path.clone(),
                        config: config.clone(),
                        timeout,
                    };
                    debug!(step = %step.id, timeout_ms = timeout.as_millis() as u64, "invoking step");
                    self.executor.invoke(&invocation)
                }
                None => Err(AgentError::timeout(Duration::from_millis(workflow.timeout_ms))),
            };

            let mut exec = lock(shared);
            let cancelled = exec.status == ExecutionStatus::Cancelled;
            let Some(record) = exec.step_mut(&step.id) else {
                return StepOutcome::Failed;
            };
            let now = Utc::now();
            record.ended_at = Some(now);
            record.duration_ms = record
                .started_at
                .map(|start| (now - start).num_milliseconds().max(0) as u64);

            let err = match result {
                Ok(output) => {
                    record.status = StepStatus::Completed;
                    record.output = Some(output);
                    record.error = None;
                    debug!(step = %step.id, retries = record.retries, "step completed");
                    return StepOutcome::Completed;
                }
                Err(err) => err,
            };
            record.status = StepStatus::Failed;
            record.error = Some(err.clone());

            let budget_spent = timeout.is_none();
            if budget_spent || !err.is_retryable() || record.retries >= policy.max_retries {
                warn!(step = %step.id, retries = record.retries, err = %err, "step failed");
                return StepOutcome::Failed;
            }
            if cancelled {
                return StepOutcome::Cancelled;
            }

            let delay = policy.delay(record.retries);
            record.retries += 1;
            record.error = None;
            record.status = StepStatus::Pending;
            warn!(
                step = %step.id,
                attempt = record.retries,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                err = %err,
                "retrying step"
            );
            drop(exec);
            self.sleeper.sleep(delay);
        }
    }

    /// Flip a running execution to `cancelled`. Steps already started finish
    /// and are recorded; no further step starts.
    /// Refuse new admissions and drop queued requests. Running executions are
    /// untouched; cancel them separately.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queued = lock(&self.queue).len(), "engine closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        let Some(shared) = lock(&self.active).get(execution_id).cloned() else {
            return false;
        };
        let mut exec = lock(&shared);
        if !exec.transition(ExecutionStatus::Cancelled) {
            return false;
        }
        exec.finish_clock(Utc::now());
        info!(execution = %execution_id, "execution cancelled");
        true
    }

    /// Snapshots of the executions currently holding a slot.
    pub fn active_executions(&self) -> Vec<PipelineExecution> {
        let shared: Vec<SharedExecution> = lock(&self.active).values().cloned().collect();
        shared.iter().map(|e| lock(e).clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn execution(&self, execution_id: &str) -> Option<PipelineExecution> {
        let shared = lock(&self.active).get(execution_id).cloned()?;
        let snapshot = lock(&shared).clone();
        Some(snapshot)
    }

    pub fn queued_requests(&self) -> Vec<QueuedRequest> {
        lock(&self.queue).iter().cloned().collect()
    }
}
