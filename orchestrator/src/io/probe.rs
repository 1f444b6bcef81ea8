//! Liveness probes for registered agents.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, instrument};
use url::{Host, Url};

use crate::core::agent::{Agent, HealthStatus};
use crate::error::AgentError;
use crate::io::manifest::{load_manifest, manifest_path};
use crate::io::process::run_command_with_timeout;

const PROBE_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one probe, before the registry stamps timing onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub message: Option<String>,
}

impl ProbeReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            error_rate: 0.0,
            message: None,
        }
    }

    pub fn warning(error_rate: f64, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Warning,
            error_rate,
            message: Some(message.into()),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Critical,
            error_rate: 1.0,
            message: Some(message.into()),
        }
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Offline,
            error_rate: 1.0,
            message: Some(message.into()),
        }
    }
}

/// Error rate recorded when the manifest is missing.
const MISSING_MANIFEST_ERROR_RATE: f64 = 0.5;
/// Error rate recorded when the help invocation does not answer.
const UNRESPONSIVE_ERROR_RATE: f64 = 0.3;

/// Strategy for checking whether an agent is alive.
///
/// An `Err` means the probe itself broke; the registry records `offline`.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, agent: &Agent) -> Result<ProbeReport, AgentError>;
}

/// Probe used in production: TCP endpoint when configured, otherwise the
/// agent's help invocation.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

impl HealthProbe for SystemProbe {
    #[instrument(skip_all, fields(agent = %agent.id))]
    fn probe(&self, agent: &Agent) -> Result<ProbeReport, AgentError> {
        let timeout = probe_timeout(agent);
        match &agent.health_check.endpoint {
            Some(endpoint) => probe_endpoint(endpoint, timeout),
            None => Ok(probe_process(agent, timeout)),
        }
    }
}

fn probe_timeout(agent: &Agent) -> Duration {
    match agent.health_check.timeout() {
        d if d.is_zero() => DEFAULT_PROBE_TIMEOUT,
        d => d,
    }
}

/// `host:port` from an endpoint URL; the port defaults by scheme. A bare
/// `host:port` is read as `http`.
pub fn endpoint_address(endpoint: &str) -> Option<(String, u16)> {
    let url = if endpoint.contains("://") {
        Url::parse(endpoint)
    } else {
        Url::parse(&format!("http://{endpoint}"))
    }
    .ok()?;
    let host = match url.host()? {
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    };
    Some((host, url.port_or_known_default()?))
}

fn probe_endpoint(endpoint: &str, timeout: Duration) -> Result<ProbeReport, AgentError> {
    let (host, port) = endpoint_address(endpoint)
        .ok_or_else(|| AgentError::health(format!("invalid endpoint '{endpoint}'")))?;
    let addrs: Vec<SocketAddr> = match (host.as_str(), port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            return Ok(ProbeReport::offline(format!("resolve {host}:{port}: {e}")));
        }
    };
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(_) => {
                debug!(%addr, "endpoint reachable");
                return Ok(ProbeReport::healthy());
            }
            Err(e) => debug!(%addr, err = %e, "endpoint connect failed"),
        }
    }
    Ok(ProbeReport::offline(format!("endpoint {endpoint} unreachable")))
}

fn probe_process(agent: &Agent, timeout: Duration) -> ProbeReport {
    let dir = &agent.path;
    if !dir.exists() {
        return ProbeReport::critical(format!("agent path not found: {}", dir.display()));
    }
    if !manifest_path(dir).exists() {
        return ProbeReport::warning(
            MISSING_MANIFEST_ERROR_RATE,
            format!("agent manifest missing in {}", dir.display()),
        );
    }
    let manifest = match load_manifest(dir) {
        Ok(m) => m,
        Err(e) => return ProbeReport::critical(format!("{e:#}")),
    };

    let attempts = agent.health_check.retries.saturating_add(1);
    let mut last = None;
    for attempt in 1..=attempts {
        let mut cmd = manifest.command(dir);
        cmd.args(&manifest.help_args);
        match run_command_with_timeout(cmd, timeout, PROBE_OUTPUT_LIMIT_BYTES) {
            Ok(out) if out.status.success() && !out.stdout.is_empty() && !out.timed_out => {
                return ProbeReport::healthy();
            }
            Ok(out) => {
                let reason = if out.timed_out {
                    format!("help invocation timed out after {}ms", timeout.as_millis())
                } else {
                    format!(
                        "help invocation exited with {:?} and {} bytes of output",
                        out.status.code(),
                        out.stdout.len()
                    )
                };
                debug!(attempt, %reason, "agent not responsive");
                last = Some(ProbeReport::warning(UNRESPONSIVE_ERROR_RATE, reason));
            }
            Err(e) => {
                debug!(attempt, err = %format!("{e:#}"), "help invocation failed to start");
                last = Some(ProbeReport::warning(UNRESPONSIVE_ERROR_RATE, format!("{e:#}")));
            }
        }
    }
    last.unwrap_or_else(|| ProbeReport::warning(UNRESPONSIVE_ERROR_RATE, "agent not responsive"))
}
