//! Final report assembled after both improvement iterations.

use serde::{Deserialize, Serialize};

use crate::core::analytics::{
    IterationAnalytics, IterationRecord, RiskAssessment, TrendComparison,
};
use crate::core::execution::{OverallStatus, PipelineExecution};
use crate::core::gates::GateOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementSummary {
    pub success_rate_delta: f64,
    pub score_delta: f64,
    pub total_iterations: u32,
}

impl ImprovementSummary {
    pub fn between(first: &IterationRecord, second: &IterationRecord, total: u32) -> Self {
        Self {
            success_rate_delta: second.success_rate - first.success_rate,
            score_delta: second.quality_score - first.quality_score,
            total_iterations: total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    pub workflow_id: String,
    pub workflow_name: String,
    /// The second iteration's execution; `None` when the engine refused it.
    pub execution: Option<PipelineExecution>,
    pub analytics: Option<IterationAnalytics>,
    pub iteration_history: Vec<IterationRecord>,
    pub trend: TrendComparison,
    pub risk: RiskAssessment,
    pub improvement: ImprovementSummary,
    pub quality_gates: Vec<GateOutcome>,
    /// A failed `block` gate was hit.
    pub blocked: bool,
    #[serde(rename = "totalTime")]
    pub total_time_ms: u64,
    pub summary: String,
}

impl FinalReport {
    /// Overall status of the final iteration; `failure` when it never ran.
    pub fn overall_status(&self) -> OverallStatus {
        self.execution
            .as_ref()
            .map_or(OverallStatus::Failure, |e| e.results.overall_status)
    }
}

/// Plain-text roll-up printed alongside the JSON report.
pub fn render_report_summary(report: &FinalReport) -> String {
    let mut lines = vec![format!(
        "{} ({}): {} iterations",
        report.workflow_name, report.workflow_id, report.improvement.total_iterations
    )];
    for record in &report.iteration_history {
        let line = match &record.error {
            Some(err) => format!("- iteration {}: error: {err}", record.iteration),
            None => format!(
                "- iteration {}: {} in {}ms, success rate {:.1}%, quality {}",
                record.iteration,
                record.status.label(),
                record.duration_ms,
                record.success_rate,
                record.quality_score
            ),
        };
        lines.push(line);
    }
    lines.push(format!(
        "- success rate delta {:+.1}%, score delta {:+}",
        report.improvement.success_rate_delta, report.improvement.score_delta
    ));
    lines.push(format!("- risk: {}", report.risk.overall.label()));
    let failed_gates: Vec<&str> = report
        .quality_gates
        .iter()
        .filter(|g| !g.passed)
        .map(|g| g.name.as_str())
        .collect();
    if !failed_gates.is_empty() {
        lines.push(format!("- failed gates: {}", failed_gates.join(", ")));
    }
    if report.blocked {
        lines.push("- blocked by quality gate".to_string());
    }
    lines.join("\n")
}
