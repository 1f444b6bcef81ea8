//! Derivation of [`ExecutionResults`] from a finished execution.

use std::path::Path;

use crate::core::execution::{
    Artifact, ArtifactKind, ExecutionResults, ExecutionStep, OverallStatus, PipelineExecution,
    RiskLevel, StepStatus,
};

/// Scores below this trigger an improvement recommendation.
pub const RECOMMENDATION_THRESHOLD: f64 = 80.0;

/// `failure` if a required step failed, `partial` if only optional steps
/// failed, `success` otherwise.
pub fn overall_status(steps: &[ExecutionStep]) -> OverallStatus {
    let mut any_failed = false;
    for step in steps.iter().filter(|s| s.is_failed()) {
        if step.required {
            return OverallStatus::Failure;
        }
        any_failed = true;
    }
    if any_failed {
        OverallStatus::Partial
    } else {
        OverallStatus::Success
    }
}

/// Quality score, test coverage, and risk level reported by completed steps.
///
/// Scores take the maximum over outputs carrying the field (default `0`);
/// risk takes the highest severity (default `low`).
pub fn reported_metrics(steps: &[ExecutionStep]) -> (f64, f64, RiskLevel) {
    let mut quality = 0.0_f64;
    let mut coverage = 0.0_f64;
    let mut risk = RiskLevel::Low;
    for step in steps.iter().filter(|s| s.is_completed()) {
        if let Some(score) = step.output_number("qualityScore") {
            quality = quality.max(score);
        }
        if let Some(cov) = step.output_number("testCoverage") {
            coverage = coverage.max(cov);
        }
        if let Some(level) = step.output_risk() {
            risk = risk.max(level);
        }
    }
    (quality, coverage, risk)
}

pub fn render_summary(execution: &PipelineExecution) -> String {
    let total = execution.steps.len();
    let failed: Vec<&ExecutionStep> = execution.steps.iter().filter(|s| s.is_failed()).collect();
    let mut out = format!("Workflow execution {}", execution.status.label());
    out.push_str(&format!("\n- Total steps: {total}"));
    out.push_str(&format!(
        "\n- Completed: {}",
        execution.count(StepStatus::Completed)
    ));
    out.push_str(&format!("\n- Failed: {}", failed.len()));
    out.push_str(&format!("\n- Skipped: {}", execution.count(StepStatus::Skipped)));
    out.push_str(&format!(
        "\n- Success rate: {:.1}%",
        execution.success_rate()
    ));
    out.push_str(&format!(
        "\n- Duration: {}ms",
        execution.duration_ms.unwrap_or(0)
    ));
    if !failed.is_empty() {
        let names: Vec<String> = failed
            .iter()
            .map(|s| match &s.error {
                Some(err) => format!("{} ({err})", s.step_id),
                None => s.step_id.clone(),
            })
            .collect();
        out.push_str(&format!("\n- Failing steps: {}", names.join(", ")));
    }
    out
}

pub fn recommendations(steps: &[ExecutionStep], quality: f64, coverage: f64) -> Vec<String> {
    let mut recs = Vec::new();
    let failed: Vec<&ExecutionStep> = steps.iter().filter(|s| s.is_failed()).collect();
    if failed.is_empty() {
        if steps.iter().any(ExecutionStep::is_completed) {
            recs.push("All steps succeeded".to_string());
        }
    } else {
        recs.push(format!("Review and fix {} failed steps", failed.len()));
        let critical = failed
            .iter()
            .filter(|s| s.required || s.retries > 0)
            .count();
        if critical > 0 {
            recs.push(format!("Prioritize fixing {critical} critical failures"));
        }
    }
    if quality < RECOMMENDATION_THRESHOLD {
        recs.push("Consider improving code quality to meet quality gates".to_string());
    }
    if coverage < RECOMMENDATION_THRESHOLD {
        recs.push("Increase test coverage to improve reliability".to_string());
    }
    recs
}

pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => "application/json",
        Some("md") => "text/markdown",
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

/// Artifact kind from the key an agent used in its `files` map.
pub fn artifact_kind_for(key: &str) -> ArtifactKind {
    match key {
        "json" => ArtifactKind::Data,
        "markdown" => ArtifactKind::Report,
        "code" => ArtifactKind::Code,
        _ => ArtifactKind::Log,
    }
}

pub fn artifact(step: &ExecutionStep, key: &str, path: &Path, size: u64) -> Artifact {
    Artifact {
        id: format!("artifact-{}-{key}", step.id),
        name: format!("{}-{key}", step.step_id),
        kind: artifact_kind_for(key),
        path: path.to_path_buf(),
        size,
        mime_type: mime_type_for(path).to_string(),
        step_id: step.step_id.clone(),
    }
}

/// Aggregate a finished execution. Artifacts are collected by the caller
/// since they require filesystem access.
pub fn build_results(execution: &PipelineExecution, artifacts: Vec<Artifact>) -> ExecutionResults {
    let (quality_score, test_coverage, risk_level) = reported_metrics(&execution.steps);
    ExecutionResults {
        overall_status: overall_status(&execution.steps),
        quality_score,
        test_coverage,
        risk_level,
        summary: render_summary(execution),
        recommendations: recommendations(&execution.steps, quality_score, test_coverage),
        artifacts,
    }
}
