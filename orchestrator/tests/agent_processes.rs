//! End-to-end tests against real agent processes.
//!
//! Each agent is a directory holding an `agent.toml` manifest that launches a
//! small shell script, so these tests only run on unix.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use orchestrator::core::agent::{AgentStatus, HealthStatus};
use orchestrator::core::execution::{ArtifactKind, ExecutionStatus, StepStatus};
use orchestrator::core::workflow::WorkflowExecutionRequest;
use orchestrator::engine::{EngineSettings, WorkflowEngine};
use orchestrator::error::ErrorKind;
use orchestrator::io::executor::{AgentExecutor, AgentInvocation, ProcessExecutor};
use orchestrator::io::probe::{HealthProbe, SystemProbe};
use orchestrator::registry::AgentRegistry;
use orchestrator::test_support::{AgentFixture, agent, step, workflow};

const HELPFUL: &str = r#"case "$1" in
  --help) echo "usage: agent [--flag value]"; exit 0 ;;
esac
"#;

fn invocation(path: &std::path::Path, timeout: Duration) -> AgentInvocation {
    AgentInvocation {
        execution_id: "exec-1-abc".to_string(),
        workflow_id: "wf".to_string(),
        step_id: "s".to_string(),
        agent_id: "a".to_string(),
        agent_path: path.to_path_buf(),
        config: serde_json::Map::new(),
        timeout,
    }
}

#[test]
fn json_stdout_becomes_step_output_and_config_becomes_flags() {
    let fixture = AgentFixture::new().expect("fixture");
    let dir = fixture
        .script_agent(
            "echo",
            r#"printf '{"qualityScore": 91, "args": "%s"}\n' "$*""#,
        )
        .expect("agent");

    let mut inv = invocation(&dir, Duration::from_secs(5));
    inv.config.insert("mode".to_string(), json!("fast"));
    inv.config.insert("verbose".to_string(), json!(true));
    inv.config.insert("dryRun".to_string(), json!(false));
    inv.config.insert("timeout".to_string(), json!(1000));
    let output = ProcessExecutor::default().invoke(&inv).expect("success");

    assert_eq!(output["qualityScore"], json!(91));
    assert_eq!(
        output["args"],
        json!("--mode fast --verbose --execution-id exec-1-abc --workflow-id wf")
    );
}

#[test]
fn plain_stdout_is_wrapped() {
    let fixture = AgentFixture::new().expect("fixture");
    let dir = fixture.script_agent("plain", "echo hello").expect("agent");

    let output = ProcessExecutor::default()
        .invoke(&invocation(&dir, Duration::from_secs(5)))
        .expect("success");

    assert_eq!(
        output,
        json!({"stdout": "hello\n", "stderr": "", "exitCode": 0})
    );
}

#[test]
fn non_zero_exit_carries_stderr() {
    let fixture = AgentFixture::new().expect("fixture");
    let dir = fixture
        .script_agent("broken", "echo 'bad input' >&2; exit 3")
        .expect("agent");

    let err = ProcessExecutor::default()
        .invoke(&invocation(&dir, Duration::from_secs(5)))
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::StepExecution);
    assert_eq!(err.message, "bad input");
}

#[test]
fn missing_manifest_is_a_retryable_execution_error() {
    let fixture = AgentFixture::new().expect("fixture");
    let dir = fixture.bare_agent("bare").expect("agent");

    let err = ProcessExecutor::default()
        .invoke(&invocation(&dir, Duration::from_secs(5)))
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::StepExecution);
    assert!(err.is_retryable());
    assert!(err.message.contains("agent.toml"), "{}", err.message);
}

/// A step with a 100ms timeout whose agent never returns fails with a
/// timeout well before the agent would finish.
#[test]
fn hung_agent_times_out_at_step_timeout() {
    let fixture = AgentFixture::new().expect("fixture");
    let dir = fixture.script_agent("hang", "exec sleep 5").expect("agent");
    let registry = Arc::new(AgentRegistry::new());
    let mut declared = agent("hang");
    declared.path = dir;
    registry.register_agent(declared);
    let engine = WorkflowEngine::new(
        ProcessExecutor::default(),
        registry,
        EngineSettings::default(),
    );

    let mut s = step("hang", 1);
    s.timeout_ms = 100;
    let started = Instant::now();
    let exec = engine
        .execute_workflow(
            &workflow("slow", vec![s]),
            &WorkflowExecutionRequest::new("slow"),
        )
        .expect("accepted");

    assert!(started.elapsed() < Duration::from_secs(3));
    let record = exec.step("hang").expect("step present");
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
    assert_eq!(exec.status, ExecutionStatus::Failed);
}

/// An agent that answers at once but leaves a background process holding its
/// stdout still fails with a timeout at the step timeout.
#[test]
fn background_process_holding_output_times_out() {
    let fixture = AgentFixture::new().expect("fixture");
    let dir = fixture
        .script_agent("forker", "sleep 3 &\necho '{\"ok\": true}'")
        .expect("agent");

    let started = Instant::now();
    let err = ProcessExecutor::default()
        .invoke(&invocation(&dir, Duration::from_millis(200)))
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(err.kind, ErrorKind::Timeout);
}

#[test]
fn files_reported_by_agents_become_artifacts() {
    let fixture = AgentFixture::new().expect("fixture");
    let dir = fixture
        .script_agent(
            "reporter",
            r#"echo '# report' > report.md
printf '{"qualityScore": 85, "testCoverage": 82, "files": {"markdown": "%s/report.md", "json": "%s/missing.json"}}\n' "$PWD" "$PWD""#,
        )
        .expect("agent");
    let registry = Arc::new(AgentRegistry::new());
    let mut declared = agent("reporter");
    declared.path = dir;
    registry.register_agent(declared);
    let engine = WorkflowEngine::new(
        ProcessExecutor::default(),
        registry,
        EngineSettings::default(),
    );

    let exec = engine
        .execute_workflow(
            &workflow("report", vec![step("reporter", 1)]),
            &WorkflowExecutionRequest::new("report"),
        )
        .expect("accepted");

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let artifacts = &exec.results.artifacts;
    assert_eq!(artifacts.len(), 1, "missing files are skipped");
    assert_eq!(artifacts[0].kind, ArtifactKind::Report);
    assert_eq!(artifacts[0].mime_type, "text/markdown");
    assert_eq!(artifacts[0].size, "# report\n".len() as u64);
    assert_eq!(artifacts[0].step_id, "reporter");
    assert_eq!(
        exec.results.recommendations,
        vec!["All steps succeeded".to_string()]
    );
}

#[test]
fn process_probe_classifies_agent_directories() {
    let fixture = AgentFixture::new().expect("fixture");
    let probe = SystemProbe;

    let mut healthy = agent("healthy");
    healthy.path = fixture.script_agent("healthy", HELPFUL).expect("agent");
    let report = probe.probe(&healthy).expect("probe");
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.error_rate, 0.0);

    let mut silent = agent("silent");
    silent.path = fixture.script_agent("silent", "exit 1").expect("agent");
    let report = probe.probe(&silent).expect("probe");
    assert_eq!(report.status, HealthStatus::Warning);
    assert_eq!(report.error_rate, 0.3);

    let mut bare = agent("bare");
    bare.path = fixture.bare_agent("bare").expect("agent");
    let report = probe.probe(&bare).expect("probe");
    assert_eq!(report.status, HealthStatus::Warning);
    assert_eq!(report.error_rate, 0.5);

    let mut missing = agent("missing");
    missing.path = fixture.path().join("does-not-exist");
    let report = probe.probe(&missing).expect("probe");
    assert_eq!(report.status, HealthStatus::Critical);
}

#[test]
fn hung_help_invocation_is_cut_off_by_probe_timeout() {
    let fixture = AgentFixture::new().expect("fixture");
    let mut hung = agent("hung");
    hung.path = fixture.script_agent("hung", "exec sleep 5").expect("agent");
    hung.health_check.timeout_ms = 100;

    let started = Instant::now();
    let report = SystemProbe.probe(&hung).expect("probe");

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.status, HealthStatus::Warning);
}

/// Registry side: a missing path demotes the agent; restoring it promotes
/// the agent back once the probe is healthy.
#[test]
fn registry_demotes_and_recovers_with_real_probe() {
    let fixture = AgentFixture::new().expect("fixture");
    let registry = AgentRegistry::new();
    let mut declared = agent("flappy");
    declared.path = fixture.path().join("flappy");
    registry.register_agent(declared);

    let health = registry.perform_health_check("flappy").expect("known agent");
    assert_eq!(health.status, HealthStatus::Critical);
    assert_eq!(health.uptime_ms, 0);
    assert_eq!(
        registry.agent("flappy").map(|a| a.status),
        Some(AgentStatus::Error)
    );

    fixture.script_agent("flappy", HELPFUL).expect("agent");
    let health = registry.perform_health_check("flappy").expect("known agent");
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(
        registry.agent("flappy").map(|a| a.status),
        Some(AgentStatus::Active)
    );
}
