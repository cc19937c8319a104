// src/manifest/definition.rs

//! Validated, immutable service definitions.
//!
//! A [`Manifest`] can only be obtained through validation, so everything in
//! here may assume: unique ids, known and acyclic `depends_on`, a complete
//! execution spec per mode, and consistent environment declarations.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::manifest::restart::RestartPolicy;
use crate::types::{CascadeMode, ExecutionMode, ServiceId};

/// Deployment-level settings taken from `[supervisor]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub workers: usize,
    pub start_timeout: Duration,
    pub call_timeout: Duration,
    pub stop_grace_period: Duration,
    pub cascade: CascadeMode,
    pub retry_ceiling: u32,
    pub liveness_interval: Duration,
}

/// How a process-backed service is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// A compose stack reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeStack {
    pub file: PathBuf,
    pub project: String,
    /// Empty means the whole stack.
    pub services: Vec<String>,
}

/// A long-running server plus its readiness signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolServerSpec {
    pub process: ProcessSpec,
    pub ready_on_stdout: Option<String>,
    pub listen: Option<String>,
}

/// Execution mode together with the data that mode needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Compose(ComposeStack),
    Command(ProcessSpec),
    ProtocolServer(ProtocolServerSpec),
}

impl Execution {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Execution::Compose(_) => ExecutionMode::Compose,
            Execution::Command(_) => ExecutionMode::Command,
            Execution::ProtocolServer(_) => ExecutionMode::ProtocolServer,
        }
    }
}

/// What a health probe talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Shell command; exit status 0 is healthy.
    Command(String),
    /// `host:port`; an accepted connection is healthy.
    Tcp(String),
    /// URL; any 2xx response is healthy.
    Http(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub target: ProbeTarget,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

/// One validated manifest entry. Has no behaviour of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub id: ServiceId,
    pub execution: Execution,
    pub depends_on: BTreeSet<ServiceId>,
    pub restart: RestartPolicy,
    pub env_allowlist: BTreeSet<String>,
    pub required_env: BTreeSet<String>,
    pub env: BTreeMap<String, String>,
    pub health: Option<HealthCheck>,
    pub security_tags: BTreeSet<String>,
}

impl ServiceDefinition {
    pub fn mode(&self) -> ExecutionMode {
        self.execution.mode()
    }

    /// Required variables that do not resolve in `resolved`.
    pub fn missing_required_env(&self, resolved: &BTreeMap<String, String>) -> Vec<String> {
        self.required_env
            .iter()
            .filter(|key| !resolved.contains_key(*key))
            .cloned()
            .collect()
    }

    /// Environment handed to the service: allow-listed and required
    /// variables present in `resolved`, plus service-declared literals.
    pub fn propagated_env(&self, resolved: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env_allowlist
            .iter()
            .chain(self.required_env.iter())
            .filter_map(|key| resolved.get(key).map(|v| (key.clone(), v.clone())))
            .collect();

        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// A validated manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    settings: SupervisorSettings,
    declared_env: BTreeSet<String>,
    services: BTreeMap<ServiceId, Arc<ServiceDefinition>>,
    /// Service ids in declaration order.
    order: Vec<ServiceId>,
}

impl Manifest {
    /// Assemble a manifest from parts that already passed validation.
    pub(crate) fn new_unchecked(
        settings: SupervisorSettings,
        declared_env: BTreeSet<String>,
        definitions: Vec<ServiceDefinition>,
    ) -> Self {
        let order = definitions.iter().map(|d| d.id.clone()).collect();
        let services = definitions
            .into_iter()
            .map(|d| (d.id.clone(), Arc::new(d)))
            .collect();

        Self {
            settings,
            declared_env,
            services,
            order,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn declared_env(&self) -> &BTreeSet<String> {
        &self.declared_env
    }

    pub fn service(&self, id: &str) -> Option<&Arc<ServiceDefinition>> {
        self.services.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    /// Service ids in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Definitions in declaration order.
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDefinition>> {
        self.order.iter().filter_map(|id| self.services.get(id))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
