//! Pipeline configuration: agents, workflows, and settings.
//!
//! Loaded from JSON or TOML (chosen by file extension), checked against the
//! embedded JSON Schema, then validated semantically.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::core::agent::{Agent, AgentStatus, CapabilityType, HealthCheckPolicy};
use crate::core::gates::{ComparisonOperator, GateAction, GateType, QualityGate};
use crate::core::workflow::{
    RetryPolicy, RollbackPolicy, WorkflowDefinition, WorkflowStep, validate_workflow,
};
use crate::error::ConfigError;

pub const PIPELINE_CONFIG_SCHEMA: &str =
    include_str!("../../../schemas/pipeline_config.schema.json");

/// Default file name used by `orchestrator init`.
pub const DEFAULT_CONFIG_FILE: &str = "pipeline.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Email,
    Slack,
    Webhook,
    Console,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Event names this channel subscribes to; empty means all.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub max_concurrent_workflows: usize,
    /// Step timeout in milliseconds when a step declares none.
    #[serde(rename = "defaultTimeout")]
    pub default_timeout_ms: u64,
    pub enable_logging: bool,
    pub enable_metrics: bool,
    pub enable_notifications: bool,
    pub quality_gates: Vec<QualityGate>,
    pub notifications: Vec<NotificationChannel>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 3,
            default_timeout_ms: 5 * 60 * 1_000,
            enable_logging: true,
            enable_metrics: true,
            enable_notifications: false,
            quality_gates: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub agents: Vec<Agent>,
    pub workflows: Vec<WorkflowDefinition>,
    pub settings: PipelineSettings,
}

impl Default for PipelineConfig {
    /// Empty pipeline used when no configuration file is given.
    fn default() -> Self {
        Self {
            id: "default-pipeline".to_string(),
            name: "Agent Pipeline".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            created_at: None,
            updated_at: None,
            agents: Vec::new(),
            workflows: Vec::new(),
            settings: PipelineSettings::default(),
        }
    }
}

fn sample_agent(
    id: &str,
    name: &str,
    capability: CapabilityType,
    dependencies: &[&str],
) -> Agent {
    Agent {
        id: id.to_string(),
        name: name.to_string(),
        capability,
        status: AgentStatus::Active,
        path: Path::new("..").join(id),
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        config: Map::new(),
        health_check: HealthCheckPolicy {
            enabled: true,
            retries: 3,
            ..HealthCheckPolicy::default()
        },
    }
}

fn sample_step(
    id: &str,
    name: &str,
    agent_id: &str,
    order: i64,
    required: bool,
    dependencies: &[&str],
    config: Value,
) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        name: name.to_string(),
        agent_id: agent_id.to_string(),
        order,
        required,
        config: config.as_object().cloned().unwrap_or_default(),
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        timeout_ms: 5 * 60 * 1_000,
        retry_policy: RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        },
        rollback_policy: RollbackPolicy::default(),
    }
}

impl PipelineConfig {
    /// Three-agent demonstration pipeline written by `orchestrator init`.
    pub fn sample() -> Self {
        let now = Utc::now();
        let steps = vec![
            sample_step(
                "generate-tests",
                "Generate Tests",
                "test-generator",
                1,
                true,
                &[],
                json!({"path": "./app", "strategy": "full-path-coverage", "maxInteractions": 100}),
            ),
            sample_step(
                "analyze-quality",
                "Analyze Quality",
                "quality-analyzer",
                2,
                true,
                &["generate-tests"],
                json!({"path": "./app"}),
            ),
            sample_step(
                "auto-fix",
                "Auto-Fix Issues",
                "auto-fix",
                3,
                false,
                &["analyze-quality"],
                json!({"path": "./app", "dryRun": true}),
            ),
        ];
        Self {
            id: "default-pipeline".to_string(),
            name: "AI Testing Pipeline".to_string(),
            description: "Test generation, quality analysis, and auto-fix".to_string(),
            version: "1.0.0".to_string(),
            created_at: Some(now),
            updated_at: Some(now),
            agents: vec![
                sample_agent(
                    "test-generator",
                    "Test Generator Agent",
                    CapabilityType::TestGenerator,
                    &[],
                ),
                sample_agent(
                    "quality-analyzer",
                    "Quality Analyzer Agent",
                    CapabilityType::QualityAnalyzer,
                    &["test-generator"],
                ),
                sample_agent(
                    "auto-fix",
                    "Auto-Fix Agent",
                    CapabilityType::AutoFix,
                    &["quality-analyzer"],
                ),
            ],
            workflows: vec![WorkflowDefinition {
                id: "full-testing-pipeline".to_string(),
                name: "Full Testing Pipeline".to_string(),
                description: "Complete testing, quality analysis, and auto-fix workflow"
                    .to_string(),
                steps,
                triggers: Vec::new(),
                conditions: Vec::new(),
                max_retries: 2,
                timeout_ms: 15 * 60 * 1_000,
                parallel: false,
                enabled: true,
            }],
            settings: PipelineSettings {
                quality_gates: vec![
                    QualityGate {
                        id: "quality-threshold".to_string(),
                        name: "Quality Score Threshold".to_string(),
                        kind: GateType::QualityScore,
                        threshold: 70.0,
                        operator: ComparisonOperator::Gte,
                        action: GateAction::Warn,
                        enabled: true,
                    },
                    QualityGate {
                        id: "test-coverage-threshold".to_string(),
                        name: "Test Coverage Threshold".to_string(),
                        kind: GateType::TestCoverage,
                        threshold: 80.0,
                        operator: ComparisonOperator::Gte,
                        action: GateAction::Warn,
                        enabled: true,
                    },
                ],
                ..PipelineSettings::default()
            },
        }
    }

    pub fn workflow(&self, id: &str) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.id == id)
    }

    /// Semantic checks beyond the schema. Returns every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.settings.max_concurrent_workflows == 0 {
            errors.push("settings.maxConcurrentWorkflows must be > 0".to_string());
        }
        if self.settings.default_timeout_ms == 0 {
            errors.push("settings.defaultTimeout must be > 0".to_string());
        }

        let mut agent_ids = BTreeSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(agent.id.as_str()) {
                errors.push(format!("duplicate agent id '{}'", agent.id));
            }
            if agent.health_check.enabled && agent.health_check.interval_ms == 0 {
                errors.push(format!(
                    "agent '{}' enables health checks with a zero interval",
                    agent.id
                ));
            }
        }
        for agent in &self.agents {
            for dep in &agent.dependencies {
                if !agent_ids.contains(dep.as_str()) {
                    errors.push(format!(
                        "agent '{}' depends on unknown agent '{dep}'",
                        agent.id
                    ));
                }
            }
        }

        let mut workflow_ids = BTreeSet::new();
        for workflow in &self.workflows {
            if !workflow_ids.insert(workflow.id.as_str()) {
                errors.push(format!("duplicate workflow id '{}'", workflow.id));
            }
            for problem in validate_workflow(workflow) {
                errors.push(format!("workflow '{}': {problem}", workflow.id));
            }
            for step in &workflow.steps {
                if !agent_ids.contains(step.agent_id.as_str()) {
                    errors.push(format!(
                        "workflow '{}': step '{}' references unknown agent '{}'",
                        workflow.id, step.id, step.agent_id
                    ));
                }
            }
        }

        let mut gate_ids = BTreeSet::new();
        for gate in &self.settings.quality_gates {
            if !gate_ids.insert(gate.id.as_str()) {
                errors.push(format!("duplicate quality gate id '{}'", gate.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

fn format_for(path: &Path) -> ConfigFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
        _ => ConfigFormat::Json,
    }
}

/// Validate a JSON document against the pipeline schema (Draft 2020-12).
pub fn schema_violations(instance: &Value) -> Vec<String> {
    let schema: Value = match serde_json::from_str(PIPELINE_CONFIG_SCHEMA) {
        Ok(schema) => schema,
        Err(e) => return vec![format!("parse embedded schema: {e}")],
    };
    let compiled = match jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
    {
        Ok(compiled) => compiled,
        Err(e) => return vec![format!("compile embedded schema: {e}")],
    };
    compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}

/// Load, schema-check, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let document: Value = match format_for(path) {
        ConfigFormat::Json => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
        ConfigFormat::Toml => toml::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
    };

    let violations = schema_violations(&document);
    if !violations.is_empty() {
        return Err(ConfigError::Schema {
            path: path.to_path_buf(),
            violations,
        });
    }

    let cfg: PipelineConfig =
        serde_json::from_value(document).map_err(|e| parse_err(e.to_string()))?;
    cfg.validate()?;
    info!(
        path = %path.display(),
        agents = cfg.agents.len(),
        workflows = cfg.workflows.len(),
        "loaded pipeline configuration"
    );
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename). The format follows
/// the file extension.
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = match format_for(path) {
        ConfigFormat::Json => serde_json::to_string_pretty(cfg).context("serialize config json")?,
        ConfigFormat::Toml => toml::to_string_pretty(cfg).context("serialize config toml")?,
    };
    buf.push('\n');
    write_atomic(path, &buf)?;
    debug!(path = %path.display(), "wrote pipeline configuration");
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("config path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_valid() {
        PipelineConfig::sample().validate().expect("sample validates");
        assert!(schema_violations(&serde_json::to_value(PipelineConfig::sample()).expect("json"))
            .is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_config(&temp.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn write_then_load_round_trips_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("pipeline.json");
        let cfg = PipelineConfig::sample();
        write_config(&path, &cfg).expect("write");
        assert!(!temp.path().join("nested").join("pipeline.json.tmp").exists());
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn write_then_load_round_trips_toml() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("pipeline.toml");
        let cfg = PipelineConfig::sample();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded.workflows, cfg.workflows);
        assert_eq!(loaded.agents, cfg.agents);
    }

    #[test]
    fn schema_rejects_unknown_capability() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.json");
        fs::write(
            &path,
            r#"{"agents":[{"id":"a","name":"A","type":"wizard","path":"."}],"workflows":[]}"#,
        )
        .expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "{err}");
    }

    #[test]
    fn semantic_errors_are_all_reported() {
        let mut cfg = PipelineConfig::sample();
        cfg.settings.max_concurrent_workflows = 0;
        cfg.workflows[0].steps[1].dependencies = vec!["nope".to_string()];
        cfg.workflows[0].steps[2].agent_id = "ghost".to_string();
        let Err(ConfigError::Invalid(errors)) = cfg.validate() else {
            panic!("expected invalid config");
        };
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("broken.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            load_config(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}
