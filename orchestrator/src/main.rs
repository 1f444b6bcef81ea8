//! Agent pipeline orchestrator CLI.
//!
//! Loads a pipeline configuration, registers its agents, and runs workflows
//! through the two-iteration improvement loop. Reports, status, and metrics
//! are printed to stdout as JSON; diagnostics go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use orchestrator::coordinator::PipelineCoordinator;
use orchestrator::core::execution::OverallStatus;
use orchestrator::core::report::render_report_summary;
use orchestrator::core::workflow::Priority;
use orchestrator::exit_codes;
use orchestrator::io::config::{DEFAULT_CONFIG_FILE, PipelineConfig, load_config, write_config};
use orchestrator::logging;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Dependency-gated agent pipeline orchestrator"
)]
struct Cli {
    /// Pipeline configuration file (JSON or TOML, by extension).
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the sample three-agent pipeline configuration if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Check the configuration against the schema and semantic rules.
    Validate,
    /// Print pipeline status.
    Status,
    /// Print pipeline metrics.
    Metrics,
    /// List registered agents.
    Agents,
    /// List enabled workflows.
    Workflows,
    /// Run one health check per agent and print the snapshots.
    Probe,
    /// Run a workflow through both improvement iterations and print the report.
    Execute {
        workflow_id: String,
        /// Extra agent argument, repeatable. Values are parsed as JSON when possible.
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        set: Vec<(String, Value)>,
        #[arg(long, default_value_t = Priority::Normal)]
        priority: Priority,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Validate => cmd_validate(&cli.config),
        Command::Status => {
            let coordinator = open(&cli.config)?;
            print_json(&coordinator.status())
        }
        Command::Metrics => {
            let coordinator = open(&cli.config)?;
            print_json(&coordinator.metrics())
        }
        Command::Agents => {
            let coordinator = open(&cli.config)?;
            print_json(&coordinator.agents())
        }
        Command::Workflows => {
            let coordinator = open(&cli.config)?;
            print_json(&coordinator.workflows())
        }
        Command::Probe => {
            let coordinator = open(&cli.config)?;
            print_json(&coordinator.check_agents())
        }
        Command::Execute {
            workflow_id,
            set,
            priority,
        } => cmd_execute(&cli.config, &workflow_id, set, priority),
    }
}

fn open(config: &Path) -> Result<PipelineCoordinator> {
    let coordinator = PipelineCoordinator::system();
    coordinator
        .initialize(Some(config))
        .with_context(|| format!("initialize pipeline from {}", config.display()))?;
    Ok(coordinator)
}

fn cmd_init(config: &Path, force: bool) -> Result<i32> {
    if !force && config.exists() {
        info!(path = %config.display(), "configuration exists, leaving it untouched");
        return Ok(exit_codes::OK);
    }
    let cfg = PipelineConfig::sample();
    write_config(config, &cfg).with_context(|| format!("write {}", config.display()))?;
    Ok(exit_codes::OK)
}

fn cmd_validate(config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    println!(
        "{}: {} agents, {} workflows",
        config.display(),
        cfg.agents.len(),
        cfg.workflows.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_execute(
    config: &Path,
    workflow_id: &str,
    set: Vec<(String, Value)>,
    priority: Priority,
) -> Result<i32> {
    let coordinator = open(config)?;
    let overrides: Map<String, Value> = set.into_iter().collect();
    let report = coordinator.execute_workflow(workflow_id, overrides, priority)?;
    eprintln!("{}", render_report_summary(&report));
    print_json(&report)?;
    let failed = report.blocked || report.overall_status() == OverallStatus::Failure;
    Ok(if failed {
        exit_codes::WORKFLOW_FAILED
    } else {
        exit_codes::OK
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<i32> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

/// `key=value`; the value is JSON when it parses as JSON, else a raw string.
fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
