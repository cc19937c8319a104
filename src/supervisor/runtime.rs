// src/supervisor/runtime.rs

//! Async IO shell around [`SupervisorCore`].
//!
//! The control loop owns the core and is the only task that mutates service
//! state. It multiplexes:
//! - control requests from [`SupervisorHandle`]s
//! - adapter call results from the worker pool
//! - retry timers
//! - health monitor reports
//!
//! and after every step records transitions in the audit log, publishes
//! fresh snapshots and answers any control request that has settled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{LaunchError, Result};
use crate::exec::{AdapterRegistry, ExecutionAdapter, ServiceHandle, StartContext};
use crate::health::{HealthMonitor, MonitorReport, Watch};
use crate::manifest::validate::validate_report;
use crate::manifest::{
    Manifest, RawManifest, ServiceDefinition, SupervisorSettings, ValidationContext, ValidationReport,
};
use crate::state::instance::InFlight;
use crate::state::{ServiceState, StateManager, StateSnapshot};
use crate::telemetry::{AuditLog, EventTail, ServiceMetrics, metrics};
use crate::types::ServiceId;

use super::core::{CoreStep, SupervisorCommand, SupervisorCore, SupervisorEvent};
use super::pool::WorkerPool;
use super::selection::{Resolved, Selection};

/// Per-service outcome of a `start` or `stop` request.
pub type ServiceResults = BTreeMap<ServiceId, Result<ServiceState>>;

const CONTROL_CAPACITY: usize = 64;

/// Stand-in deadline for bounds too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

enum Control {
    Start {
        selection: Selection,
        reply: oneshot::Sender<ServiceResults>,
    },
    Stop {
        selection: Selection,
        force: bool,
        reply: oneshot::Sender<ServiceResults>,
    },
    Validate {
        raw: Box<RawManifest>,
        reply: oneshot::Sender<ValidationReport>,
    },
    SetEnvironment {
        env: BTreeMap<String, String>,
        reply: oneshot::Sender<()>,
    },
    Reload {
        manifest: Box<Manifest>,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<ServiceResults>,
    },
}

/// A started service and the adapter that owns it.
#[derive(Clone)]
struct Live {
    handle: ServiceHandle,
    adapter: Arc<dyn ExecutionAdapter>,
}

/// Messages from tasks the control loop spawned.
enum Internal {
    Started {
        service: ServiceId,
        epoch: u64,
        result: std::result::Result<Live, String>,
    },
    Stopped {
        service: ServiceId,
        epoch: u64,
        result: std::result::Result<(), String>,
    },
    RetryDue {
        service: ServiceId,
        token: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Start,
    Stop,
}

/// A control request waiting for its services to settle.
struct Waiter {
    kind: WaitKind,
    pending: Vec<ServiceId>,
    results: ServiceResults,
    started: Instant,
    deadline: Instant,
    reply: oneshot::Sender<ServiceResults>,
    /// Exit the control loop once answered.
    shutdown: bool,
}

/// The supervisor control loop. Build with [`Supervisor::new`], then drive
/// it with [`Supervisor::run`].
pub struct Supervisor {
    core: SupervisorCore,
    registry: AdapterRegistry,
    pool: WorkerPool,
    monitor: HealthMonitor,
    state: StateManager,
    audit: AuditLog,
    control_rx: mpsc::Receiver<Control>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    reports_rx: mpsc::UnboundedReceiver<MonitorReport>,
    handles: HashMap<ServiceId, Live>,
    stops_in_flight: HashSet<ServiceId>,
    retry_timers: HashMap<ServiceId, JoinHandle<()>>,
    waiters: Vec<Waiter>,
    exiting: bool,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("core", &self.core)
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        manifest: Manifest,
        env: BTreeMap<String, String>,
        registry: AdapterRegistry,
    ) -> (Self, SupervisorHandle) {
        let settings = manifest.settings().clone();
        let pool = WorkerPool::new(settings.workers);

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let monitor = HealthMonitor::new(
            pool.clone(),
            settings.liveness_interval,
            settings.call_timeout,
            reports_tx,
        );

        let state = StateManager::new();
        let audit = AuditLog::new();
        let core = SupervisorCore::new(manifest, env);
        state.publish(core.snapshots());

        let handle = SupervisorHandle {
            control: control_tx,
            state: state.clone(),
            audit: audit.clone(),
        };

        let supervisor = Self {
            core,
            registry,
            pool,
            monitor,
            state,
            audit,
            control_rx,
            internal_tx,
            internal_rx,
            reports_rx,
            handles: HashMap::new(),
            stops_in_flight: HashSet::new(),
            retry_timers: HashMap::new(),
            waiters: Vec::new(),
            exiting: false,
        };

        (supervisor, handle)
    }

    /// Build the supervisor and run its control loop on a background task.
    pub fn spawn(
        manifest: Manifest,
        env: BTreeMap<String, String>,
        registry: AdapterRegistry,
    ) -> SupervisorHandle {
        let (supervisor, handle) = Self::new(manifest, env, registry);
        tokio::spawn(supervisor.run());
        handle
    }

    /// Main control loop. Returns after `shutdown` completes or once every
    /// [`SupervisorHandle`] is dropped.
    pub async fn run(mut self) {
        info!(
            services = self.core.manifest().len(),
            workers = self.pool.workers(),
            cascade = ?self.core.manifest().settings().cascade,
            "supervisor started"
        );

        loop {
            let deadline = self.waiters.iter().map(|w| w.deadline).min();

            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(control) => self.on_control(control),
                    None => {
                        info!("all supervisor handles dropped; exiting");
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                Some(report) = self.reports_rx.recv() => self.on_report(report),
                _ = sleep_until(deadline) => {}
            }

            self.settle_waiters();
            if self.exiting {
                break;
            }
        }

        self.teardown().await;
        info!("supervisor stopped");
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Start { selection, reply } => {
                let resolved = selection.resolve(self.core.manifest().ids());
                self.feed(SupervisorEvent::StartRequested {
                    services: resolved.services.clone(),
                    correlation: Uuid::new_v4(),
                });
                self.wait(WaitKind::Start, resolved, reply, false);
            }
            Control::Stop {
                selection,
                force,
                reply,
            } => {
                let resolved = selection.resolve(self.core.manifest().ids());
                self.feed(SupervisorEvent::StopRequested {
                    services: resolved.services.clone(),
                    force,
                    correlation: Uuid::new_v4(),
                });
                self.wait(WaitKind::Stop, resolved, reply, false);
            }
            Control::Validate { raw, reply } => {
                let ctx = ValidationContext::with_env(self.core.environment().clone());
                let _ = reply.send(validate_report(*raw, &ctx));
            }
            Control::SetEnvironment { env, reply } => {
                self.feed(SupervisorEvent::EnvironmentChanged { env });
                let _ = reply.send(());
            }
            Control::Reload { manifest, reply } => {
                let deferred = deferred_settings(self.core.manifest().settings(), manifest.settings());
                if !deferred.is_empty() {
                    warn!(fields = ?deferred, "[supervisor] settings changed on reload; these apply after a restart");
                }
                self.feed(SupervisorEvent::Reloaded {
                    manifest: *manifest,
                });
                let _ = reply.send(());
            }
            Control::Shutdown { reply } => {
                info!("shutdown requested; stopping all services");
                let resolved = Selection::All.resolve(self.core.manifest().ids());
                self.feed(SupervisorEvent::StopRequested {
                    services: resolved.services.clone(),
                    force: false,
                    correlation: Uuid::new_v4(),
                });
                self.wait(WaitKind::Stop, resolved, reply, true);
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Started {
                service,
                epoch,
                result,
            } => {
                let current = self
                    .core
                    .instance(&service)
                    .is_some_and(|i| i.epoch == epoch && i.in_flight == Some(InFlight::Start));

                let result = match result {
                    Ok(live) if current => {
                        debug!(service = %service, instance = live.handle.instance(), "storing service handle");
                        self.handles.insert(service.clone(), live);
                        Ok(())
                    }
                    Ok(live) => {
                        warn!(service = %service, epoch, "start finished for a superseded request; stopping orphan");
                        tokio::spawn(async move {
                            if let Err(e) = live.adapter.stop(&live.handle, true).await {
                                warn!(service = %live.handle.service(), error = %e, "failed to stop orphaned service");
                            }
                        });
                        return;
                    }
                    Err(e) => Err(e),
                };

                self.feed(SupervisorEvent::StartFinished {
                    service,
                    epoch,
                    result,
                });
            }
            Internal::Stopped {
                service,
                epoch,
                result,
            } => {
                self.stops_in_flight.remove(&service);
                let current = self
                    .core
                    .instance(&service)
                    .is_none_or(|i| i.epoch == epoch && i.in_flight == Some(InFlight::Stop));
                if current {
                    self.handles.remove(&service);
                }
                self.feed(SupervisorEvent::StopFinished {
                    service,
                    epoch,
                    result,
                });
            }
            Internal::RetryDue { service, token } => {
                self.retry_timers.remove(&service);
                self.feed(SupervisorEvent::RetryDue { service, token });
            }
        }
    }

    fn on_report(&mut self, report: MonitorReport) {
        match report {
            MonitorReport::Probed {
                service,
                epoch,
                result,
            } => self.feed(SupervisorEvent::Probed {
                service,
                epoch,
                healthy: result.healthy,
                latency: result.latency,
                detail: result.detail,
            }),
            MonitorReport::Exited {
                service,
                epoch,
                clean,
            } => {
                let current = self
                    .core
                    .instance(&service)
                    .is_some_and(|i| i.epoch == epoch && i.in_flight.is_none());
                if current {
                    self.handles.remove(&service);
                }
                self.feed(SupervisorEvent::Exited {
                    service,
                    epoch,
                    clean,
                });
            }
        }
    }

    fn feed(&mut self, event: SupervisorEvent) {
        debug!(?event, "supervisor received event");
        let step = self.core.step(event);
        self.apply(step);
    }

    fn apply(&mut self, step: CoreStep) {
        for t in step.transitions {
            self.audit
                .record(&t.service, t.from, t.to, t.degraded, t.correlation, t.detail);
        }
        for command in step.commands {
            self.execute(command);
        }
        self.state.publish(self.core.snapshots());
    }

    fn execute(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Start {
                service,
                epoch,
                definition,
                env,
            } => self.spawn_start(service, epoch, definition, env),
            SupervisorCommand::Stop {
                service,
                epoch,
                force,
            } => self.spawn_stop(service, epoch, force),
            SupervisorCommand::ScheduleRetry {
                service,
                token,
                delay,
            } => {
                debug!(service = %service, token, ?delay, "scheduling retry");
                let tx = self.internal_tx.clone();
                let svc = service.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Internal::RetryDue {
                        service: svc,
                        token,
                    });
                });
                if let Some(previous) = self.retry_timers.insert(service, timer) {
                    previous.abort();
                }
            }
            SupervisorCommand::CancelRetry { service } => {
                if let Some(timer) = self.retry_timers.remove(&service) {
                    timer.abort();
                    debug!(service = %service, "pending retry cancelled");
                }
            }
            SupervisorCommand::Monitor {
                service,
                epoch,
                definition,
            } => {
                let Some(live) = self.handles.get(&service).cloned() else {
                    warn!(service = %service, "monitor requested without a live handle");
                    return;
                };
                self.monitor.watch(Watch {
                    service,
                    epoch,
                    handle: live.handle,
                    check: definition.health.clone(),
                    adapter: live.adapter,
                });
            }
            SupervisorCommand::Unmonitor { service } => self.monitor.unwatch(&service),
            SupervisorCommand::Forget { service } => {
                self.handles.remove(&service);
                if let Some(timer) = self.retry_timers.remove(&service) {
                    timer.abort();
                }
                debug!(service = %service, "service forgotten");
            }
        }
    }

    fn spawn_start(
        &mut self,
        service: ServiceId,
        epoch: u64,
        definition: Arc<ServiceDefinition>,
        env: BTreeMap<String, String>,
    ) {
        let tx = self.internal_tx.clone();
        let mode = definition.mode();
        let Some(adapter) = self.registry.get(mode) else {
            let _ = tx.send(Internal::Started {
                service,
                epoch,
                result: Err(format!("no adapter registered for mode '{mode}'")),
            });
            return;
        };

        let timeout = self.core.manifest().settings().call_timeout;
        let ctx = StartContext {
            definition,
            env,
            existing: self.handles.get(&service).map(|l| l.handle.clone()),
            timeout,
        };

        debug!(service = %service, epoch, %mode, free_workers = self.pool.available(), "dispatching start");
        let svc = service.clone();
        self.pool.spawn(&service, async move {
            let result = match tokio::time::timeout(timeout, adapter.start(ctx)).await {
                Ok(Ok(handle)) => Ok(Live {
                    handle,
                    adapter: adapter.clone(),
                }),
                Ok(Err(e)) => Err(LaunchError::Adapter {
                    service: svc.clone(),
                    message: format!("{e:#}"),
                }
                .to_string()),
                Err(_) => Err(LaunchError::Timeout {
                    service: svc.clone(),
                    operation: "start",
                    elapsed: timeout,
                }
                .to_string()),
            };
            let _ = tx.send(Internal::Started {
                service: svc,
                epoch,
                result,
            });
        });
    }

    fn spawn_stop(&mut self, service: ServiceId, epoch: u64, force: bool) {
        let tx = self.internal_tx.clone();
        let Some(live) = self.handles.get(&service).cloned() else {
            let _ = tx.send(Internal::Stopped {
                service,
                epoch,
                result: Ok(()),
            });
            return;
        };

        let settings = self.core.manifest().settings();
        let bound = settings.call_timeout.saturating_add(settings.stop_grace_period);
        debug!(service = %service, epoch, force, "dispatching stop");

        let svc = service.clone();
        let fut = async move {
            let result = match tokio::time::timeout(bound, live.adapter.stop(&live.handle, force)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(_) => Err(LaunchError::Timeout {
                    service: svc.clone(),
                    operation: "stop",
                    elapsed: bound,
                }
                .to_string()),
            };
            let _ = tx.send(Internal::Stopped {
                service: svc,
                epoch,
                result,
            });
        };

        if self.stops_in_flight.insert(service.clone()) {
            self.pool.spawn(&service, fut);
        } else {
            // A forced stop must not queue behind the graceful one it overrides.
            tokio::spawn(fut);
        }
    }

    fn wait(
        &mut self,
        kind: WaitKind,
        resolved: Resolved,
        reply: oneshot::Sender<ServiceResults>,
        shutdown: bool,
    ) {
        let settings = self.core.manifest().settings();
        let bound = match kind {
            WaitKind::Start => settings.start_timeout,
            WaitKind::Stop => settings
                .start_timeout
                .max(settings.call_timeout.saturating_add(settings.stop_grace_period)),
        };

        let results = resolved
            .unknown
            .into_iter()
            .map(|id| (id.clone(), Err(LaunchError::UnknownService(id))))
            .collect();

        let started = Instant::now();
        self.waiters.push(Waiter {
            kind,
            pending: resolved.services,
            results,
            started,
            deadline: started.checked_add(bound).unwrap_or(started + FAR_FUTURE),
            reply,
            shutdown,
        });
    }

    fn settle_waiters(&mut self) {
        let now = Instant::now();

        for mut waiter in std::mem::take(&mut self.waiters) {
            let mut still_pending = Vec::new();
            for id in std::mem::take(&mut waiter.pending) {
                let outcome = match waiter.kind {
                    WaitKind::Start => self.core.start_outcome(&id),
                    WaitKind::Stop => self.core.stop_outcome(&id),
                };
                match outcome {
                    Some(result) => {
                        waiter.results.insert(id, result);
                    }
                    None => still_pending.push(id),
                }
            }

            if !still_pending.is_empty() && now >= waiter.deadline {
                let elapsed = now - waiter.started;
                for id in still_pending.drain(..) {
                    let err = match waiter.kind {
                        WaitKind::Start => self.core.start_timeout_error(&id, elapsed),
                        WaitKind::Stop => LaunchError::Timeout {
                            service: id.clone(),
                            operation: "stop",
                            elapsed,
                        },
                    };
                    warn!(service = %id, error = %err, "request did not settle in time");
                    waiter.results.insert(id, Err(err));
                }
            }

            if still_pending.is_empty() {
                if waiter.shutdown {
                    self.exiting = true;
                }
                let _ = waiter.reply.send(waiter.results);
            } else {
                waiter.pending = still_pending;
                self.waiters.push(waiter);
            }
        }
    }

    async fn teardown(&mut self) {
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
        self.monitor.unwatch_all();

        let call_timeout = self.core.manifest().settings().call_timeout;
        for (service, live) in self.handles.drain() {
            debug!(service = %service, "killing leftover service on exit");
            let _ = tokio::time::timeout(call_timeout, live.adapter.stop(&live.handle, true)).await;
        }
    }
}

/// Settings that are baked into the worker pool, the health monitor or the
/// adapters when the supervisor is built.
fn deferred_settings(current: &SupervisorSettings, next: &SupervisorSettings) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.workers != next.workers {
        changed.push("workers");
    }
    if current.liveness_interval != next.liveness_interval {
        changed.push("liveness_interval");
    }
    if current.stop_grace_period != next.stop_grace_period {
        changed.push("stop_grace_period");
    }
    changed
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Cloneable control surface for a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    control: mpsc::Sender<Control>,
    state: StateManager,
    audit: AuditLog,
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("services", &self.state.service_ids())
            .field("events", &self.audit.len())
            .finish()
    }
}

impl SupervisorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Control) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(make(tx))
            .await
            .map_err(|_| LaunchError::SupervisorGone)?;
        rx.await.map_err(|_| LaunchError::SupervisorGone)
    }

    /// Start the selected services and their transitive dependencies.
    ///
    /// Resolves once every selected service is ready, failed, or the start
    /// timeout elapsed.
    pub async fn start(&self, selection: Selection) -> Result<ServiceResults> {
        self.request(|reply| Control::Start { selection, reply }).await
    }

    /// Stop the selected services and everything that depends on them,
    /// dependents first.
    pub async fn stop(&self, selection: Selection, force: bool) -> Result<ServiceResults> {
        self.request(|reply| Control::Stop {
            selection,
            force,
            reply,
        })
        .await
    }

    pub fn status(&self, selection: &Selection) -> Result<Vec<StateSnapshot>> {
        let known = self.state.service_ids();
        let services = selection
            .resolve(known.iter().map(String::as_str))
            .require_known()?;
        Ok(services
            .iter()
            .filter_map(|id| self.state.get(id))
            .collect())
    }

    pub fn tail_events(&self, service: Option<ServiceId>, since: Option<DateTime<Utc>>) -> EventTail {
        self.audit.tail(service, since)
    }

    pub fn metrics(&self) -> BTreeMap<ServiceId, ServiceMetrics> {
        metrics::collect(&self.state, Utc::now())
    }

    /// Validate `raw` against the supervisor's current environment without
    /// touching any service.
    pub async fn validate(&self, raw: RawManifest) -> Result<ValidationReport> {
        self.request(|reply| Control::Validate {
            raw: Box::new(raw),
            reply,
        })
        .await
    }

    /// Replace the resolved environment used for later starts.
    pub async fn set_environment(&self, env: BTreeMap<String, String>) -> Result<()> {
        self.request(|reply| Control::SetEnvironment { env, reply }).await
    }

    pub async fn reload(&self, manifest: Manifest) -> Result<()> {
        self.request(|reply| Control::Reload {
            manifest: Box::new(manifest),
            reply,
        })
        .await
    }

    /// Stop every service and end the control loop.
    pub async fn shutdown(&self) -> Result<ServiceResults> {
        self.request(|reply| Control::Shutdown { reply }).await
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}
