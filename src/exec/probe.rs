// src/exec/probe.rs

//! Health probes.
//!
//! Every probe runs under `tokio::time::timeout` with the check's own
//! timeout and always produces a [`ProbeResult`]; errors and timeouts are
//! reported as unhealthy.
//!
//! Health commands run with the service's own environment, never the
//! supervisor's.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::trace;

use crate::manifest::{HealthCheck, ProbeTarget};

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency: Duration,
    pub detail: String,
}

impl ProbeResult {
    pub fn healthy(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            latency,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            detail: detail.into(),
        }
    }
}

/// Run `check` once. `env` is the environment of the probed service.
pub async fn run_health_check(check: &HealthCheck, env: &BTreeMap<String, String>) -> ProbeResult {
    let started = Instant::now();

    let outcome = tokio::time::timeout(check.timeout, probe_target(&check.target, env)).await;
    let latency = started.elapsed();

    let result = match outcome {
        Ok(Ok(detail)) => ProbeResult::healthy(latency, detail),
        Ok(Err(detail)) => ProbeResult::unhealthy(latency, detail),
        Err(_) => ProbeResult::unhealthy(
            latency,
            format!("probe timed out after {:?}", check.timeout),
        ),
    };

    trace!(
        target_kind = target_kind(&check.target),
        healthy = result.healthy,
        latency_ms = latency.as_millis() as u64,
        detail = %result.detail,
        "health probe finished"
    );
    result
}

fn target_kind(target: &ProbeTarget) -> &'static str {
    match target {
        ProbeTarget::Command(_) => "command",
        ProbeTarget::Tcp(_) => "tcp",
        ProbeTarget::Http(_) => "http",
    }
}

async fn probe_target(target: &ProbeTarget, env: &BTreeMap<String, String>) -> Result<String, String> {
    match target {
        ProbeTarget::Command(cmd) => probe_command(cmd, env).await,
        ProbeTarget::Tcp(addr) => probe_tcp(addr).await,
        ProbeTarget::Http(url) => probe_http(url).await,
    }
}

async fn probe_command(cmd: &str, env: &BTreeMap<String, String>) -> Result<String, String> {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("/bin/sh");
        c.arg("-c").arg(cmd);
        c
    };

    let status = command
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| format!("failed to run health command: {e}"))?;

    if status.success() {
        Ok("command exited with status 0".to_string())
    } else {
        Err(format!("command exited with {status}"))
    }
}

async fn probe_tcp(addr: &str) -> Result<String, String> {
    TcpStream::connect(addr)
        .await
        .map(|_| format!("connected to {addr}"))
        .map_err(|e| format!("connect to {addr} failed: {e}"))
}

async fn probe_http(url: &str) -> Result<String, String> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| format!("GET {url} failed: {e}"))?;

    let status = response.status();
    if status.is_success() {
        Ok(format!("GET {url} returned {status}"))
    } else {
        Err(format!("GET {url} returned {status}"))
    }
}
