//! Quality gates and workflow conditions, evaluated against aggregated results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::execution::{ExecutionResults, RiskLevel};
use crate::core::workflow::{ConditionType, WorkflowCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl ComparisonOperator {
    pub fn compare(self, actual: f64, expected: f64) -> bool {
        match self {
            ComparisonOperator::Gt => actual > expected,
            ComparisonOperator::Gte => actual >= expected,
            ComparisonOperator::Lt => actual < expected,
            ComparisonOperator::Lte => actual <= expected,
            ComparisonOperator::Eq => (actual - expected).abs() < f64::EPSILON,
            ComparisonOperator::Ne => (actual - expected).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Lte => "<=",
            ComparisonOperator::Eq => "==",
            ComparisonOperator::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateType {
    TestCoverage,
    QualityScore,
    RiskLevel,
    Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Block,
    Warn,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGate {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: GateType,
    /// Risk-level gates use the severity rank (1 = low .. 4 = critical);
    /// performance gates use milliseconds.
    pub threshold: f64,
    pub operator: ComparisonOperator,
    pub action: GateAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub id: String,
    pub name: String,
    pub passed: bool,
    pub action: GateAction,
    pub actual: f64,
    pub threshold: f64,
    pub message: String,
}

impl GateOutcome {
    pub fn blocks(&self) -> bool {
        !self.passed && self.action == GateAction::Block
    }
}

fn gate_metric(kind: GateType, results: &ExecutionResults, duration_ms: u64) -> f64 {
    match kind {
        GateType::TestCoverage => results.test_coverage,
        GateType::QualityScore => results.quality_score,
        GateType::RiskLevel => f64::from(results.risk_level.rank()),
        GateType::Performance => duration_ms as f64,
    }
}

/// Evaluate every enabled gate. Disabled gates produce no outcome.
pub fn evaluate_quality_gates(
    gates: &[QualityGate],
    results: &ExecutionResults,
    duration_ms: u64,
) -> Vec<GateOutcome> {
    gates
        .iter()
        .filter(|gate| gate.enabled)
        .map(|gate| {
            let actual = gate_metric(gate.kind, results, duration_ms);
            let passed = gate.operator.compare(actual, gate.threshold);
            let verdict = if passed { "passed" } else { "failed" };
            GateOutcome {
                id: gate.id.clone(),
                name: gate.name.clone(),
                passed,
                action: gate.action,
                actual,
                threshold: gate.threshold,
                message: format!(
                    "{} {verdict}: {actual} {} {}",
                    gate.name,
                    gate.operator.symbol(),
                    gate.threshold
                ),
            }
        })
        .collect()
}

/// Condition values may be numbers, numeric strings, or risk level names.
fn condition_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s
            .parse::<f64>()
            .ok()
            .or_else(|| RiskLevel::parse(s).map(|r| f64::from(r.rank()))),
        _ => None,
    }
}

fn condition_metric(condition: &WorkflowCondition, results: &ExecutionResults) -> Option<f64> {
    match condition.kind {
        ConditionType::QualityScore => Some(results.quality_score),
        ConditionType::TestCoverage => Some(results.test_coverage),
        ConditionType::RiskLevel => Some(f64::from(results.risk_level.rank())),
        ConditionType::Custom => {
            let serialized = serde_json::to_value(results).ok()?;
            condition_number(serialized.get(&condition.field)?)
        }
    }
}

/// Evaluate workflow conditions. Conditions only ever warn; an unresolvable
/// field or value fails the condition.
pub fn evaluate_conditions(
    conditions: &[WorkflowCondition],
    results: &ExecutionResults,
) -> Vec<GateOutcome> {
    conditions
        .iter()
        .enumerate()
        .map(|(idx, condition)| {
            let label = match condition.kind {
                ConditionType::QualityScore => "qualityScore".to_string(),
                ConditionType::TestCoverage => "testCoverage".to_string(),
                ConditionType::RiskLevel => "riskLevel".to_string(),
                ConditionType::Custom => condition.field.clone(),
            };
            let actual = condition_metric(condition, results);
            let expected = condition_number(&condition.value);
            let (passed, actual, threshold, message) = match (actual, expected) {
                (Some(actual), Some(expected)) => {
                    let passed = condition.operator.compare(actual, expected);
                    let verdict = if passed { "met" } else { "not met" };
                    (
                        passed,
                        actual,
                        expected,
                        format!(
                            "condition {label} {} {expected} {verdict} (actual {actual})",
                            condition.operator.symbol()
                        ),
                    )
                }
                _ => (
                    false,
                    0.0,
                    0.0,
                    format!("condition {label} could not be evaluated"),
                ),
            };
            GateOutcome {
                id: format!("condition-{}", idx + 1),
                name: label,
                passed,
                action: GateAction::Warn,
                actual,
                threshold,
                message,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(kind: GateType, operator: ComparisonOperator, threshold: f64) -> QualityGate {
        QualityGate {
            id: "g".to_string(),
            name: "Gate".to_string(),
            kind,
            threshold,
            operator,
            action: GateAction::Block,
            enabled: true,
        }
    }

    fn results() -> ExecutionResults {
        ExecutionResults {
            quality_score: 85.0,
            test_coverage: 70.0,
            risk_level: RiskLevel::High,
            ..ExecutionResults::default()
        }
    }

    #[test]
    fn coverage_gate_blocks_below_threshold() {
        let outcomes = evaluate_quality_gates(
            &[gate(GateType::TestCoverage, ComparisonOperator::Gte, 80.0)],
            &results(),
            0,
        );
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].blocks());
    }

    #[test]
    fn risk_gate_compares_by_rank() {
        let outcomes = evaluate_quality_gates(
            &[gate(GateType::RiskLevel, ComparisonOperator::Lte, 3.0)],
            &results(),
            0,
        );
        assert!(outcomes[0].passed);
        assert_eq!(outcomes[0].actual, 3.0);
    }

    #[test]
    fn performance_gate_uses_duration() {
        let outcomes = evaluate_quality_gates(
            &[gate(GateType::Performance, ComparisonOperator::Lt, 1_000.0)],
            &results(),
            1_500,
        );
        assert!(!outcomes[0].passed);
    }

    #[test]
    fn disabled_gates_are_ignored() {
        let mut disabled = gate(GateType::QualityScore, ComparisonOperator::Gt, 99.0);
        disabled.enabled = false;
        assert!(evaluate_quality_gates(&[disabled], &results(), 0).is_empty());
    }

    #[test]
    fn conditions_accept_risk_names_and_custom_fields() {
        let conditions = vec![
            WorkflowCondition {
                kind: ConditionType::RiskLevel,
                operator: ComparisonOperator::Ne,
                value: Value::from("critical"),
                field: String::new(),
            },
            WorkflowCondition {
                kind: ConditionType::Custom,
                operator: ComparisonOperator::Gt,
                value: Value::from(80),
                field: "qualityScore".to_string(),
            },
            WorkflowCondition {
                kind: ConditionType::Custom,
                operator: ComparisonOperator::Gt,
                value: Value::from(1),
                field: "nope".to_string(),
            },
        ];
        let outcomes = evaluate_conditions(&conditions, &results());
        assert!(outcomes[0].passed);
        assert!(outcomes[1].passed);
        assert!(!outcomes[2].passed);
        assert!(outcomes.iter().all(|o| o.action == GateAction::Warn));
    }
}
