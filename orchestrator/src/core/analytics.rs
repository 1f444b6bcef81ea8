//! Cross-iteration analytics: timing, resources, error patterns, trend, risk.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::execution::{
    ExecutionStatus, OverallStatus, PipelineExecution, RiskLevel, StepStatus,
};
use crate::error::ErrorKind;

/// Execution time above which a performance risk is raised.
pub const SLOW_EXECUTION_MS: u64 = 5 * 60 * 1_000;
/// Peak reported memory above which a resource risk is raised.
pub const HIGH_MEMORY: f64 = 2_000.0;
/// Error rate above which a reliability risk is raised.
pub const HIGH_ERROR_RATE: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingDistribution {
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

/// Linear-interpolation percentile over an ascending slice. `p` in `[0, 1]`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

impl TimingDistribution {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        Some(Self {
            samples: n,
            min: sorted[0],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
            p25: percentile(&sorted, 0.25),
            median: percentile(&sorted, 0.5),
            p75: percentile(&sorted, 0.75),
            p90: percentile(&sorted, 0.9),
            p95: percentile(&sorted, 0.95),
        })
    }
}

/// Extremes of `memoryUsage` / `cpuUsage` reported by step outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub peak_memory: Option<f64>,
    pub average_memory: Option<f64>,
    pub peak_cpu: Option<f64>,
    pub average_cpu: Option<f64>,
}

fn peak_and_average(values: &[f64]) -> (Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None);
    }
    let peak = values.iter().copied().fold(f64::MIN, f64::max);
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    (Some(peak), Some(avg))
}

impl ResourceUsage {
    pub fn from_execution(execution: &PipelineExecution) -> Self {
        let memory: Vec<f64> = execution
            .steps
            .iter()
            .filter_map(|s| s.output_number("memoryUsage"))
            .collect();
        let cpu: Vec<f64> = execution
            .steps
            .iter()
            .filter_map(|s| s.output_number("cpuUsage"))
            .collect();
        let (peak_memory, average_memory) = peak_and_average(&memory);
        let (peak_cpu, average_cpu) = peak_and_average(&cpu);
        Self {
            peak_memory,
            average_memory,
            peak_cpu,
            average_cpu,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPatterns {
    pub counts: BTreeMap<ErrorKind, usize>,
    /// Failed steps over total steps.
    pub error_rate: f64,
    pub most_frequent: Option<ErrorKind>,
}

impl ErrorPatterns {
    pub fn from_execution(execution: &PipelineExecution) -> Self {
        let mut counts: BTreeMap<ErrorKind, usize> = BTreeMap::new();
        for step in execution.steps.iter().filter(|s| s.is_failed()) {
            if let Some(err) = &step.error {
                *counts.entry(err.kind).or_default() += 1;
            }
        }
        let total = execution.steps.len();
        let error_rate = if total == 0 {
            0.0
        } else {
            execution.count(StepStatus::Failed) as f64 / total as f64
        };
        let mut most_frequent: Option<(ErrorKind, usize)> = None;
        for (kind, count) in &counts {
            if most_frequent.is_none_or(|(_, best)| *count > best) {
                most_frequent = Some((*kind, *count));
            }
        }
        Self {
            counts,
            error_rate,
            most_frequent: most_frequent.map(|(kind, _)| kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessFactor {
    pub step_id: String,
    pub name: String,
    pub duration_ms: u64,
    pub retries: u32,
    pub quality_score: Option<f64>,
}

pub fn success_factors(execution: &PipelineExecution) -> Vec<SuccessFactor> {
    execution
        .steps
        .iter()
        .filter(|s| s.is_completed())
        .map(|s| SuccessFactor {
            step_id: s.step_id.clone(),
            name: s.name.clone(),
            duration_ms: s.duration_ms.unwrap_or(0),
            retries: s.retries,
            quality_score: s.output_number("qualityScore"),
        })
        .collect()
}

/// Analytics overlaid on the second iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationAnalytics {
    pub step_durations: BTreeMap<String, u64>,
    pub timing: Option<TimingDistribution>,
    pub resources: ResourceUsage,
    pub errors: ErrorPatterns,
    pub success_factors: Vec<SuccessFactor>,
}

pub fn analyze(execution: &PipelineExecution) -> IterationAnalytics {
    let step_durations: BTreeMap<String, u64> = execution
        .steps
        .iter()
        .filter_map(|s| Some((s.step_id.clone(), s.duration_ms?)))
        .collect();
    let samples: Vec<f64> = step_durations.values().map(|d| *d as f64).collect();
    IterationAnalytics {
        timing: TimingDistribution::from_samples(&samples),
        step_durations,
        resources: ResourceUsage::from_execution(execution),
        errors: ErrorPatterns::from_execution(execution),
        success_factors: success_factors(execution),
    }
}

/// One entry of the coordinator's iteration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    pub workflow_id: String,
    pub execution_id: Option<String>,
    pub status: ExecutionStatus,
    pub overall_status: OverallStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success_rate: f64,
    pub quality_score: f64,
    pub test_coverage: f64,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IterationRecord {
    pub fn from_execution(iteration: u32, execution: &PipelineExecution) -> Self {
        Self {
            iteration,
            workflow_id: execution.workflow_id.clone(),
            execution_id: Some(execution.id.clone()),
            status: execution.status,
            overall_status: execution.results.overall_status,
            started_at: execution.started_at,
            duration_ms: execution.duration_ms.unwrap_or(0),
            success_rate: execution.success_rate(),
            quality_score: execution.results.quality_score,
            test_coverage: execution.results.test_coverage,
            risk_level: execution.results.risk_level,
            error: None,
        }
    }

    /// An iteration the engine refused to run.
    pub fn failed(iteration: u32, workflow_id: &str, error: impl Into<String>) -> Self {
        Self {
            iteration,
            workflow_id: workflow_id.to_string(),
            execution_id: None,
            status: ExecutionStatus::Failed,
            overall_status: OverallStatus::Failure,
            started_at: Utc::now(),
            duration_ms: 0,
            success_rate: 0.0,
            quality_score: 0.0,
            test_coverage: 0.0,
            risk_level: RiskLevel::Low,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendComparison {
    /// Second minus first; negative means faster.
    pub execution_time_delta_ms: i64,
    pub success_rate_delta: f64,
    pub direction: TrendDirection,
}

pub fn compare(first: &IterationRecord, second: &IterationRecord) -> TrendComparison {
    let execution_time_delta_ms = second.duration_ms as i64 - first.duration_ms as i64;
    let success_rate_delta = second.success_rate - first.success_rate;
    let direction = if success_rate_delta > 0.0 {
        TrendDirection::Improving
    } else if success_rate_delta < 0.0 {
        TrendDirection::Declining
    } else {
        TrendDirection::Stable
    };
    TrendComparison {
        execution_time_delta_ms,
        success_rate_delta,
        direction,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskCategory {
    Performance,
    Resource,
    Reliability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFinding {
    pub category: RiskCategory,
    pub level: RiskLevel,
    pub description: String,
    pub mitigation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub overall: RiskLevel,
    pub findings: Vec<RiskFinding>,
}

pub fn assess_risk(duration_ms: u64, analytics: &IterationAnalytics) -> RiskAssessment {
    let mut findings = Vec::new();
    if duration_ms > SLOW_EXECUTION_MS {
        findings.push(RiskFinding {
            category: RiskCategory::Performance,
            level: RiskLevel::Medium,
            description: format!("execution took {duration_ms}ms"),
            mitigation: "Profile the slowest steps and tighten their timeouts".to_string(),
        });
    }
    if let Some(peak) = analytics.resources.peak_memory.filter(|m| *m > HIGH_MEMORY) {
        findings.push(RiskFinding {
            category: RiskCategory::Resource,
            level: RiskLevel::High,
            description: format!("peak memory usage {peak}"),
            mitigation: "Reduce agent memory footprint or split the workload".to_string(),
        });
    }
    let rate = analytics.errors.error_rate;
    if rate > HIGH_ERROR_RATE {
        findings.push(RiskFinding {
            category: RiskCategory::Reliability,
            level: RiskLevel::Critical,
            description: format!("error rate {:.1}%", rate * 100.0),
            mitigation: "Investigate failing steps before the next run".to_string(),
        });
    }
    let overall = findings
        .iter()
        .map(|f| f.level)
        .max()
        .unwrap_or(RiskLevel::Low);
    RiskAssessment { overall, findings }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::workflow::WorkflowDefinition;
    use crate::error::AgentError;

    fn execution(step_count: usize) -> PipelineExecution {
        let steps: Vec<_> = (0..step_count)
            .map(|i| json!({"id": format!("s{i}"), "name": format!("S{i}"), "agentId": "a", "order": i}))
            .collect();
        let wf: WorkflowDefinition =
            serde_json::from_value(json!({"id": "wf", "name": "wf", "steps": steps}))
                .expect("workflow");
        PipelineExecution::new("exec", "pipe", &wf, Default::default())
    }

    #[test]
    fn percentiles_interpolate_linearly() {
        let dist =
            TimingDistribution::from_samples(&[40.0, 10.0, 30.0, 20.0]).expect("distribution");
        assert_eq!(dist.min, 10.0);
        assert_eq!(dist.max, 40.0);
        assert_eq!(dist.mean, 25.0);
        assert_eq!(dist.median, 25.0);
        assert_eq!(dist.p25, 17.5);
        assert_eq!(dist.p75, 32.5);
        assert!((dist.p90 - 37.0).abs() < 1e-9);
    }

    #[test]
    fn empty_samples_have_no_distribution() {
        assert!(TimingDistribution::from_samples(&[]).is_none());
    }

    #[test]
    fn error_patterns_count_failed_steps() {
        let mut exec = execution(5);
        for (idx, err) in [
            AgentError::timeout(std::time::Duration::from_millis(10)),
            AgentError::execution("boom"),
            AgentError::execution("boom again"),
        ]
        .into_iter()
        .enumerate()
        {
            exec.steps[idx].status = StepStatus::Failed;
            exec.steps[idx].error = Some(err);
        }
        let patterns = ErrorPatterns::from_execution(&exec);
        assert_eq!(patterns.counts[&ErrorKind::StepExecution], 2);
        assert_eq!(patterns.counts[&ErrorKind::Timeout], 1);
        assert_eq!(patterns.most_frequent, Some(ErrorKind::StepExecution));
        assert!((patterns.error_rate - 0.6).abs() < 1e-9);
    }

    #[test]
    fn resources_track_peak_and_average() {
        let mut exec = execution(2);
        exec.steps[0].output = Some(json!({"memoryUsage": 1000, "cpuUsage": 20}));
        exec.steps[1].output = Some(json!({"memoryUsage": 3000}));
        let usage = ResourceUsage::from_execution(&exec);
        assert_eq!(usage.peak_memory, Some(3000.0));
        assert_eq!(usage.average_memory, Some(2000.0));
        assert_eq!(usage.peak_cpu, Some(20.0));
    }

    #[test]
    fn risk_takes_highest_triggered_level() {
        let mut exec = execution(4);
        exec.steps[0].output = Some(json!({"memoryUsage": 2500}));
        exec.steps[1].status = StepStatus::Failed;
        let analytics = analyze(&exec);
        let risk = assess_risk(SLOW_EXECUTION_MS + 1, &analytics);
        let categories: Vec<_> = risk.findings.iter().map(|f| f.category).collect();
        assert_eq!(
            categories,
            vec![
                RiskCategory::Performance,
                RiskCategory::Resource,
                RiskCategory::Reliability
            ]
        );
        assert_eq!(risk.overall, RiskLevel::Critical);
        assert!(risk.findings.iter().all(|f| !f.mitigation.is_empty()));
    }

    #[test]
    fn quiet_run_is_low_risk() {
        let risk = assess_risk(1_000, &analyze(&execution(3)));
        assert_eq!(risk.overall, RiskLevel::Low);
        assert!(risk.findings.is_empty());
    }

    #[test]
    fn trend_reports_second_minus_first() {
        let mut first = IterationRecord::failed(1, "wf", "x");
        first.duration_ms = 900;
        first.success_rate = 50.0;
        let mut second = first.clone();
        second.iteration = 2;
        second.duration_ms = 600;
        second.success_rate = 100.0;
        let trend = compare(&first, &second);
        assert_eq!(trend.execution_time_delta_ms, -300);
        assert_eq!(trend.success_rate_delta, 50.0);
        assert_eq!(trend.direction, TrendDirection::Improving);
    }
}
