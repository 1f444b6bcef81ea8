//! Workflow definitions, step ordering, and load-time validation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::gates::ComparisonOperator;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    #[serde(rename = "initialDelay")]
    pub initial_delay_ms: u64,
    #[serde(rename = "maxDelay")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`:
    /// `min(initial_delay * backoff_multiplier^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.clamp(0.0, self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.round() as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStrategy {
    #[default]
    Full,
    Partial,
    Incremental,
}

/// Declared undo strategy for a step. Carried through configuration only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollbackPolicy {
    pub enabled: bool,
    pub strategy: RollbackStrategy,
    pub checkpoint_interval: u64,
    pub max_checkpoints: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    /// Execution order. Ties keep declaration order.
    pub order: i64,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Milliseconds; `0` falls back to the engine default.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub rollback_policy: RollbackPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    Manual,
    Schedule,
    Webhook,
    FileChange,
    QualityGate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    #[serde(rename = "type")]
    pub kind: TriggerType,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionType {
    QualityScore,
    TestCoverage,
    RiskLevel,
    Custom,
}

/// Post-run condition evaluated against aggregated results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub operator: ComparisonOperator,
    pub value: Value,
    #[serde(default)]
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    #[serde(default)]
    pub max_retries: u32,
    /// Overall budget in milliseconds; `0` means unbounded.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: u64,
    /// Declared in the schema but never honored: steps always run sequentially.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(label)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!(
                "unknown priority '{other}' (expected low, normal, high, critical)"
            )),
        }
    }
}

/// A request to run one workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionRequest {
    pub workflow_id: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    /// Caps every step timeout when set (milliseconds).
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl WorkflowExecutionRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Self::default()
        }
    }
}

/// Steps in execution order: ascending `order`, ties in declaration order.
pub fn execution_order(steps: &[WorkflowStep]) -> Vec<&WorkflowStep> {
    let mut ordered: Vec<&WorkflowStep> = steps.iter().collect();
    // `sort_by_key` is stable, which keeps declaration order for equal keys.
    ordered.sort_by_key(|step| step.order);
    ordered
}

/// Validate that the step graph is runnable.
///
/// Rejects empty or duplicate step ids, dependencies on unknown steps,
/// dependency cycles, and dependencies that would only run after their
/// dependent (which would otherwise surface as a permanently skipped step).
/// Returns stable error messages, empty on success.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            errors.push("step with empty id".to_string());
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
        if step.agent_id.trim().is_empty() {
            errors.push(format!("step '{}' has no agent id", step.id));
        }
    }

    for step in &workflow.steps {
        for dep in &step.dependencies {
            if dep == &step.id {
                errors.push(format!("step '{}' depends on itself", step.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
    }
    if !errors.is_empty() {
        return errors;
    }

    if let Some(cycle) = find_cycle(&workflow.steps) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
        return errors;
    }

    let position: HashMap<&str, usize> = execution_order(&workflow.steps)
        .iter()
        .enumerate()
        .map(|(idx, step)| (step.id.as_str(), idx))
        .collect();
    for step in &workflow.steps {
        for dep in &step.dependencies {
            if position[dep.as_str()] > position[step.id.as_str()] {
                errors.push(format!(
                    "step '{}' depends on '{}' which is ordered after it",
                    step.id, dep
                ));
            }
        }
    }
    errors
}

fn find_cycle(steps: &[WorkflowStep]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        for dep in edges.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(cycle) = visit(*dep, edges, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let edges: BTreeMap<&str, Vec<&str>> = steps
        .iter()
        .map(|step| {
            (
                step.id.as_str(),
                step.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for id in edges.keys() {
        if let Some(cycle) = visit(*id, &edges, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, order: i64, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_uppercase(),
            agent_id: "agent".to_string(),
            order,
            required: true,
            config: Map::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            timeout_ms: 0,
            retry_policy: RetryPolicy::default(),
            rollback_policy: RollbackPolicy::default(),
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "Workflow".to_string(),
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

    #[test]
    fn delay_grows_exponentially_until_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_multiplier: 2.0,
            initial_delay_ms: 100,
            max_delay_ms: 500,
        };
        let delays: Vec<u64> = (0..5).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn delay_survives_huge_exponents() {
        let policy = RetryPolicy {
            max_retries: u32::MAX,
            backoff_multiplier: 10.0,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
        };
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn execution_order_is_stable_for_ties() {
        let steps = vec![step("c", 2, &[]), step("a", 1, &[]), step("b", 1, &[])];
        let ids: Vec<&str> = execution_order(&steps)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_chain_passes() {
        let wf = workflow(vec![
            step("a", 1, &[]),
            step("b", 2, &["a"]),
            step("c", 3, &["b"]),
        ]);
        assert!(validate_workflow(&wf).is_empty());
    }

    #[test]
    fn unknown_and_duplicate_ids_are_reported() {
        let wf = workflow(vec![
            step("a", 1, &[]),
            step("a", 2, &[]),
            step("b", 3, &["missing"]),
        ]);
        let errors = validate_workflow(&wf);
        assert!(errors.iter().any(|e| e.contains("duplicate step id 'a'")));
        assert!(errors.iter().any(|e| e.contains("unknown step 'missing'")));
    }

    #[test]
    fn cycles_are_reported() {
        let wf = workflow(vec![step("a", 1, &["b"]), step("b", 2, &["a"])]);
        let errors = validate_workflow(&wf);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("dependency cycle:"), "{errors:?}");
    }

    #[test]
    fn dependency_ordered_after_dependent_is_reported() {
        let wf = workflow(vec![step("a", 2, &[]), step("b", 1, &["a"])]);
        let errors = validate_workflow(&wf);
        assert_eq!(
            errors,
            vec!["step 'b' depends on 'a' which is ordered after it".to_string()]
        );
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
    }
}
