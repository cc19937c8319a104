// src/manifest/model.rs

//! Raw, TOML-backed manifest model.
//!
//! ```toml
//! [supervisor]
//! workers = 8
//! cascade = "stop"
//!
//! [policy]
//! require_security_tags = true
//!
//! [environment]
//! declare = ["DATABASE_URL", "PATH"]
//!
//! [[service]]
//! id = "api"
//! mode = "command"
//! command = "./api"
//! depends_on = ["db"]
//! ```
//!
//! Nothing here is validated; [`crate::manifest::validate`] turns a
//! [`RawManifest`] into a [`Manifest`](crate::manifest::Manifest).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::manifest::duration;
use crate::manifest::restart::MaxRetries;
use crate::types::{CascadeMode, ExecutionMode, HealthCheckKind, RestartPolicyKind};

/// Top-level manifest as read from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawManifest {
    /// Deployment-level supervisor settings from `[supervisor]`.
    #[serde(default)]
    pub supervisor: SupervisorSection,

    /// Security-tag lint settings from `[policy]`.
    #[serde(default)]
    pub policy: PolicySection,

    /// Variables the surrounding configuration layer promises to provide.
    #[serde(default)]
    pub environment: EnvironmentSection,

    /// All services from `[[service]]`, in declaration order.
    #[serde(default)]
    pub service: Vec<ServiceConfig>,
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    /// Size of the bounded worker pool for adapter calls.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Overall bound for a `start` request to settle.
    #[serde(default = "default_start_timeout", deserialize_with = "duration::deserialize")]
    pub start_timeout: Duration,

    /// Bound for a single adapter `start` or `stop` call.
    #[serde(default = "default_call_timeout", deserialize_with = "duration::deserialize")]
    pub call_timeout: Duration,

    /// How long a graceful stop waits before escalating to a kill.
    #[serde(
        default = "default_stop_grace_period",
        deserialize_with = "duration::deserialize"
    )]
    pub stop_grace_period: Duration,

    /// What happens to dependents of a `FAILED` service. Must be set
    /// explicitly; validation rejects a manifest without it.
    #[serde(default)]
    pub cascade: Option<CascadeMode>,

    /// Retry budget used for `max_retries = "unbounded"`.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// How often running services are polled with `is_alive`.
    #[serde(
        default = "default_liveness_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub liveness_interval: Duration,
}

fn default_workers() -> usize {
    8
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_ceiling() -> u32 {
    1000
}

fn default_liveness_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            start_timeout: default_start_timeout(),
            call_timeout: default_call_timeout(),
            stop_grace_period: default_stop_grace_period(),
            cascade: None,
            retry_ceiling: default_retry_ceiling(),
            liveness_interval: default_liveness_interval(),
        }
    }
}

/// `[policy]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySection {
    /// Reject services without any `security_tags`.
    #[serde(default)]
    pub require_security_tags: bool,

    /// If non-empty, every tag used by a service must be in this list.
    #[serde(default)]
    pub allowed_security_tags: Vec<String>,
}

/// `[environment]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentSection {
    /// Names of variables the deployment provides. `env_allowlist` and
    /// `required_env` may only reference these.
    #[serde(default)]
    pub declare: Vec<String>,
}

/// One `[[service]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub id: String,

    pub mode: ExecutionMode,

    /// Executable for `command` and `protocol-server` services.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Stack reference for `compose` services.
    #[serde(default)]
    pub compose: Option<ComposeConfig>,

    /// Regex a `protocol-server` prints on stdout once it is ready.
    #[serde(default)]
    pub ready_on_stdout: Option<String>,

    /// `host:port` a `protocol-server` accepts connections on once ready.
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Inherited variables propagated to the service. Nothing else is.
    #[serde(default)]
    pub env_allowlist: Vec<String>,

    /// Variables that must resolve before the service may start.
    #[serde(default)]
    pub required_env: Vec<String>,

    /// Service-declared variables with literal values.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub health: Option<HealthConfig>,

    #[serde(default)]
    pub security_tags: Vec<String>,
}

/// `compose = { file = "...", project = "...", services = [...] }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Compose project name; defaults to the service id.
    #[serde(default)]
    pub project: Option<String>,

    /// Subset of compose services to manage; empty means the whole stack.
    #[serde(default)]
    pub services: Vec<String>,
}

/// `restart = { ... }`.
#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    #[serde(default)]
    pub policy: RestartPolicyKind,

    #[serde(default = "default_backoff_base", deserialize_with = "duration::deserialize")]
    pub backoff_base: Duration,

    #[serde(default = "default_backoff_cap", deserialize_with = "duration::deserialize")]
    pub backoff_cap: Duration,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default)]
    pub max_retries: MaxRetries,
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicyKind::default(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            jitter: default_jitter(),
            max_retries: MaxRetries::default(),
        }
    }
}

/// `health = { kind = "...", ... }`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub kind: HealthCheckKind,

    /// Shell command for `kind = "command"`.
    #[serde(default)]
    pub command: Option<String>,

    /// `host:port` for `kind = "tcp"`.
    #[serde(default)]
    pub address: Option<String>,

    /// URL for `kind = "http"`.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_health_interval", deserialize_with = "duration::deserialize")]
    pub interval: Duration,

    #[serde(default = "default_health_timeout", deserialize_with = "duration::deserialize")]
    pub timeout: Duration,

    /// Consecutive failed probes before a service is considered unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_failure_threshold() -> u32 {
    3
}

impl HealthConfig {
    /// A health config of the given kind with default timings and no target.
    pub fn new(kind: HealthCheckKind) -> Self {
        Self {
            kind,
            command: None,
            address: None,
            url: None,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}
