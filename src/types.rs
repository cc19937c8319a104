// src/types.rs

//! Small shared enums used by the manifest model, the supervisor and the CLI.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical service identifier used throughout the crate.
pub type ServiceId = String;

/// Mechanism used to run a service.
///
/// Each variant maps to exactly one adapter in the
/// [`AdapterRegistry`](crate::exec::AdapterRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// A `docker compose` stack.
    Compose,
    /// A plain local process.
    Command,
    /// A long-running server process that announces readiness.
    ProtocolServer,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 3] = [
        ExecutionMode::Compose,
        ExecutionMode::Command,
        ExecutionMode::ProtocolServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Compose => "compose",
            ExecutionMode::Command => "command",
            ExecutionMode::ProtocolServer => "protocol-server",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether (and when) a failed service is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    /// First failure is terminal.
    Never,
    /// Restart after crashes, failed starts and failed health checks.
    OnFailure,
    /// Like `OnFailure`, but a clean process exit is restarted too.
    Always,
}

impl Default for RestartPolicyKind {
    fn default() -> Self {
        RestartPolicyKind::OnFailure
    }
}

impl FromStr for RestartPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "never" => Ok(RestartPolicyKind::Never),
            "on-failure" | "on_failure" | "onfailure" => Ok(RestartPolicyKind::OnFailure),
            "always" => Ok(RestartPolicyKind::Always),
            other => Err(format!(
                "invalid restart policy: {other} (expected \"never\", \"on-failure\" or \"always\")"
            )),
        }
    }
}

/// What happens to dependents when a service reaches `FAILED`.
///
/// - `Stop`: running dependents are marked degraded and stopped gracefully,
///   dependents first.
/// - `Degrade`: dependents are only marked degraded; running processes are
///   left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeMode {
    Stop,
    Degrade,
}

impl FromStr for CascadeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stop" => Ok(CascadeMode::Stop),
            "degrade" => Ok(CascadeMode::Degrade),
            other => Err(format!(
                "invalid cascade mode: {other} (expected \"stop\" or \"degrade\")"
            )),
        }
    }
}

/// Kind of health check declared for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    Command,
    Tcp,
    Http,
}
