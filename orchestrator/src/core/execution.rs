//! Execution records produced by the engine.
//!
//! A [`PipelineExecution`] is owned by the engine for the duration of one
//! run and handed back by value once it reaches a terminal state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::workflow::WorkflowDefinition;
use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// `pending -> running -> {completed | failed | cancelled}`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (
                    ExecutionStatus::Running,
                    ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
                )
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    #[default]
    Success,
    Partial,
    Failure,
}

/// Severity reported by agents. Variant order is the severity order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Numeric rank, 1 (`low`) through 4 (`critical`).
    pub fn rank(self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
            RiskLevel::Critical => 4,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Report,
    Log,
    Data,
    Code,
}

/// A file produced by a completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size: u64,
    pub mime_type: String,
    pub step_id: String,
}

/// Aggregated outcome of one run. Derived once at the end of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResults {
    pub overall_status: OverallStatus,
    pub quality_score: f64,
    pub test_coverage: f64,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub recommendations: Vec<String>,
    pub artifacts: Vec<Artifact>,
}

/// Per-step record, one for each workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub id: String,
    pub step_id: String,
    pub name: String,
    pub required: bool,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "duration")]
    pub duration_ms: Option<u64>,
    pub output: Option<Value>,
    pub error: Option<AgentError>,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl ExecutionStep {
    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Numeric field reported in this step's output, if any.
    pub fn output_number(&self, field: &str) -> Option<f64> {
        self.output.as_ref()?.get(field)?.as_f64()
    }

    pub fn output_risk(&self) -> Option<RiskLevel> {
        let raw = self.output.as_ref()?.get("riskLevel")?.as_str()?;
        RiskLevel::parse(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    pub id: String,
    pub pipeline_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "duration")]
    pub duration_ms: Option<u64>,
    pub steps: Vec<ExecutionStep>,
    pub metadata: Map<String, Value>,
    pub results: ExecutionResults,
}

impl PipelineExecution {
    /// Allocate a pending execution with one pending step per workflow step.
    pub fn new(
        id: impl Into<String>,
        pipeline_id: impl Into<String>,
        workflow: &WorkflowDefinition,
        metadata: Map<String, Value>,
    ) -> Self {
        let steps = workflow
            .steps
            .iter()
            .map(|step| ExecutionStep {
                id: format!("step-{}", step.id),
                step_id: step.id.clone(),
                name: step.name.clone(),
                required: step.required,
                status: StepStatus::Pending,
                started_at: None,
                ended_at: None,
                duration_ms: None,
                output: None,
                error: None,
                retries: 0,
                skip_reason: None,
            })
            .collect();
        Self {
            id: id.into(),
            pipeline_id: pipeline_id.into(),
            workflow_id: workflow.id.clone(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            steps,
            metadata,
            results: ExecutionResults::default(),
        }
    }

    /// Apply a status transition. Returns false (and changes nothing) if the
    /// transition is not allowed, e.g. out of a terminal state.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn step(&self, step_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut ExecutionStep> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Percentage of steps that completed, `0` for an empty workflow.
    pub fn success_rate(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.count(StepStatus::Completed) as f64 / self.steps.len() as f64 * 100.0
    }

    /// Dependencies of `deps` that have not completed.
    pub fn unmet_dependencies(&self, deps: &[String]) -> Vec<String> {
        deps.iter()
            .filter(|dep| !self.step(dep).is_some_and(ExecutionStep::is_completed))
            .cloned()
            .collect()
    }

    /// Stamp the end time and duration.
    pub fn finish_clock(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);
        let millis = (ended_at - self.started_at).num_milliseconds().max(0);
        self.duration_ms = Some(millis as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exit() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            for next in [
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn pending_must_run_before_finishing() {
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Completed));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Cancelled));
    }

    #[test]
    fn risk_levels_order_by_severity() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::parse("HIGH"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse("severe"), None);
    }
}
