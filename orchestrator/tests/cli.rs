//! CLI tests for the `orchestrator` binary.
//!
//! Spawns the binary in a temporary directory and verifies exit codes for
//! configuration bootstrap, validation, and workflow execution.

use std::fs;
use std::process::Command;

use orchestrator::exit_codes;
use orchestrator::io::config::{PipelineConfig, load_config, write_config};
use orchestrator::test_support::{agent, step, workflow};

fn orchestrator() -> Command {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
}

#[test]
fn init_writes_a_config_that_validates() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = orchestrator()
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("orchestrator init");
    assert_eq!(status.code(), Some(exit_codes::OK));

    let cfg = load_config(&temp.path().join("pipeline.json")).expect("load sample");
    assert_eq!(cfg.agents.len(), 3);

    let output = orchestrator()
        .current_dir(temp.path())
        .arg("validate")
        .output()
        .expect("orchestrator validate");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("3 agents"), "{stdout}");
}

#[test]
fn init_leaves_an_existing_config_alone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("pipeline.json");
    fs::write(&path, "{}").expect("write placeholder");

    let status = orchestrator()
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("orchestrator init");

    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(fs::read_to_string(&path).expect("read"), "{}");
}

#[test]
fn missing_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = orchestrator()
        .current_dir(temp.path())
        .args(["--config", "absent.toml", "status"])
        .status()
        .expect("orchestrator status");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn unknown_workflow_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = PipelineConfig {
        agents: vec![agent("A")],
        workflows: vec![workflow("only", vec![step("A", 1)])],
        ..PipelineConfig::default()
    };
    write_config(&temp.path().join("pipeline.json"), &cfg).expect("write config");

    let status = orchestrator()
        .current_dir(temp.path())
        .args(["execute", "nope"])
        .status()
        .expect("orchestrator execute");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

/// Agents pointing at missing directories fail their required step, so the
/// run completes with a failure report and the workflow-failed exit code.
#[test]
fn failing_workflow_prints_report_and_exits_workflow_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = PipelineConfig {
        agents: vec![agent("A")],
        workflows: vec![workflow("only", vec![step("A", 1)])],
        ..PipelineConfig::default()
    };
    write_config(&temp.path().join("pipeline.json"), &cfg).expect("write config");

    let output = orchestrator()
        .current_dir(temp.path())
        .args(["execute", "only"])
        .output()
        .expect("orchestrator execute");

    assert_eq!(output.status.code(), Some(exit_codes::WORKFLOW_FAILED));
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report is json");
    assert_eq!(report["workflowId"], "only");
    assert_eq!(report["iterationHistory"].as_array().map(Vec::len), Some(2));
}
