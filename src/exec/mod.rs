// src/exec/mod.rs

//! Execution adapters.
//!
//! The supervisor never spawns anything itself; it talks to an
//! [`ExecutionAdapter`] looked up by [`ExecutionMode`] in an
//! [`AdapterRegistry`] that is built once at startup. Tests register fakes
//! in the same registry.
//!
//! - [`command`]: plain local processes.
//! - [`protocol`]: long-running servers with a readiness signal.
//! - [`compose`]: `docker compose` stacks.
//! - [`probe`]: command / TCP / HTTP health checks shared by all adapters.

pub mod command;
pub mod compose;
pub mod probe;
pub mod process;
pub mod protocol;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::manifest::{ComposeStack, HealthCheck, ServiceDefinition, SupervisorSettings};
use crate::types::{ExecutionMode, ServiceId};

pub use command::CommandAdapter;
pub use compose::ComposeAdapter;
pub use probe::ProbeResult;
pub use process::ManagedProcess;
pub use protocol::ProtocolServerAdapter;

/// Boxed future returned by adapter methods.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// What an adapter needs to start one service.
#[derive(Debug, Clone)]
pub struct StartContext {
    pub definition: Arc<ServiceDefinition>,
    /// Fully resolved environment for the child: allow-listed and required
    /// variables plus service-declared literals. Nothing else.
    pub env: BTreeMap<String, String>,
    /// Handle from a previous start, if any. A live one is returned as-is.
    pub existing: Option<ServiceHandle>,
    /// Bound for readiness waits inside `start`.
    pub timeout: Duration,
}

impl StartContext {
    pub fn service(&self) -> &str {
        &self.definition.id
    }
}

/// Mechanism-specific part of a [`ServiceHandle`].
#[derive(Debug, Clone)]
pub enum HandleKind {
    Process(Arc<ManagedProcess>),
    Compose { stack: ComposeStack },
    /// Nothing to manage; used by adapters that keep their own bookkeeping.
    Detached,
}

/// Opaque reference to a started service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    service: ServiceId,
    instance: u64,
    started_at: DateTime<Utc>,
    kind: HandleKind,
    /// Environment the service was started with; health commands run with it.
    env: Arc<BTreeMap<String, String>>,
}

impl ServiceHandle {
    pub fn new(service: impl Into<ServiceId>, kind: HandleKind) -> Self {
        Self {
            service: service.into(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            started_at: Utc::now(),
            kind,
            env: Arc::default(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn detached(service: impl Into<ServiceId>) -> Self {
        Self::new(service, HandleKind::Detached)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Process-wide unique id of this handle.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn kind(&self) -> &HandleKind {
        &self.kind
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn process(&self) -> Option<&Arc<ManagedProcess>> {
        match &self.kind {
            HandleKind::Process(p) => Some(p),
            _ => None,
        }
    }

    /// `Some(true)` if the underlying process is known to have exited with
    /// success, `Some(false)` for any other observed exit, `None` if unknown.
    pub fn exited_cleanly(&self) -> Option<bool> {
        self.process()
            .and_then(|p| p.exit_status())
            .map(|status| status.success())
    }
}

/// Uniform capability set for one execution mechanism.
///
/// Implementations keep no durable state about services; everything the
/// supervisor decides on lives in its own instances.
pub trait ExecutionAdapter: Send + Sync {
    /// Start the service, or return `ctx.existing` if it is still alive.
    fn start(&self, ctx: StartContext) -> AdapterFuture<'_, anyhow::Result<ServiceHandle>>;

    /// Graceful stop waits up to the grace period before killing;
    /// `force` kills immediately.
    fn stop<'a>(
        &'a self,
        handle: &'a ServiceHandle,
        force: bool,
    ) -> AdapterFuture<'a, anyhow::Result<()>>;

    /// Run the declared health check. Must honour `check.timeout` and report
    /// unhealthy rather than hang.
    fn probe<'a>(
        &'a self,
        handle: &'a ServiceHandle,
        check: &'a HealthCheck,
    ) -> AdapterFuture<'a, ProbeResult> {
        Box::pin(probe::run_health_check(check, handle.env()))
    }

    fn is_alive<'a>(&'a self, handle: &'a ServiceHandle) -> AdapterFuture<'a, bool>;

    /// How the service ended, once `is_alive` reported it gone.
    fn exited_cleanly(&self, handle: &ServiceHandle) -> Option<bool> {
        handle.exited_cleanly()
    }
}

/// Explicit lookup table from execution mode to adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ExecutionMode, Arc<dyn ExecutionAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modes: Vec<_> = self.adapters.keys().collect();
        modes.sort();
        f.debug_struct("AdapterRegistry")
            .field("modes", &modes)
            .finish()
    }
}

impl AdapterRegistry {
    /// Empty registry; every mode must be registered explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the real adapter for every mode.
    pub fn with_defaults(settings: &SupervisorSettings) -> Self {
        let grace = settings.stop_grace_period;
        let mut registry = Self::new();
        registry.register(ExecutionMode::Command, Arc::new(CommandAdapter::new(grace)));
        registry.register(
            ExecutionMode::ProtocolServer,
            Arc::new(ProtocolServerAdapter::new(grace)),
        );
        registry.register(ExecutionMode::Compose, Arc::new(ComposeAdapter::new(grace)));
        registry
    }

    /// Register (or replace) the adapter for `mode`.
    pub fn register(&mut self, mode: ExecutionMode, adapter: Arc<dyn ExecutionAdapter>) -> &mut Self {
        self.adapters.insert(mode, adapter);
        self
    }

    pub fn get(&self, mode: ExecutionMode) -> Option<Arc<dyn ExecutionAdapter>> {
        self.adapters.get(&mode).cloned()
    }

    pub fn modes(&self) -> impl Iterator<Item = ExecutionMode> + '_ {
        self.adapters.keys().copied()
    }
}
