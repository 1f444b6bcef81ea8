//! Artifact discovery from completed step outputs.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::core::execution::{Artifact, PipelineExecution};
use crate::core::results::artifact;

/// Every existing file named in a completed step's `files` map
/// (`kind -> path`). Missing files are skipped.
pub fn collect_artifacts(execution: &PipelineExecution) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    for step in execution.steps.iter().filter(|s| s.is_completed()) {
        let Some(files) = step
            .output
            .as_ref()
            .and_then(|o| o.get("files"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        for (key, path) in files {
            let Some(path) = path.as_str().map(Path::new) else {
                continue;
            };
            match fs::metadata(path) {
                Ok(meta) if meta.is_file() => {
                    artifacts.push(artifact(step, key, path, meta.len()));
                }
                Ok(_) => debug!(path = %path.display(), "artifact is not a file"),
                Err(e) => debug!(path = %path.display(), err = %e, "artifact missing"),
            }
        }
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::execution::{ArtifactKind, StepStatus};
    use crate::core::workflow::WorkflowDefinition;

    #[test]
    fn collects_existing_files_from_completed_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = temp.path().join("report.json");
        fs::write(&report, "{\"ok\":true}").expect("write report");

        let wf: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf",
            "name": "wf",
            "steps": [
                {"id": "a", "name": "A", "agentId": "x", "order": 1},
                {"id": "b", "name": "B", "agentId": "x", "order": 2}
            ]
        }))
        .expect("workflow");
        let mut exec = PipelineExecution::new("exec", "pipe", &wf, Default::default());
        let files = json!({"files": {
            "json": report.to_string_lossy(),
            "markdown": temp.path().join("missing.md").to_string_lossy()
        }});
        exec.steps[0].status = StepStatus::Completed;
        exec.steps[0].output = Some(files.clone());
        exec.steps[1].status = StepStatus::Failed;
        exec.steps[1].output = Some(files);

        let artifacts = collect_artifacts(&exec);
        assert_eq!(artifacts.len(), 1);
        let found = &artifacts[0];
        assert_eq!(found.id, "artifact-step-a-json");
        assert_eq!(found.name, "a-json");
        assert_eq!(found.kind, ArtifactKind::Data);
        assert_eq!(found.size, 11);
        assert_eq!(found.mime_type, "application/json");
        assert_eq!(found.step_id, "a");
    }
}
