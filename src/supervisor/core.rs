// src/supervisor/core.rs

//! Pure supervisor state machine.
//!
//! [`SupervisorCore`] consumes [`SupervisorEvent`]s and returns a
//! [`CoreStep`]: the [`SupervisorCommand`]s the async shell must carry out
//! and the [`Transition`]s it must record. It owns every
//! [`ServiceInstance`] and is the only place their state changes.
//!
//! No channels, no tokio, no processes: every decision can be exercised
//! synchronously in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::DependencyGraph;
use crate::errors::LaunchError;
use crate::manifest::{Manifest, ServiceDefinition};
use crate::state::instance::InFlight;
use crate::state::{ServiceInstance, ServiceState, StateSnapshot};
use crate::types::{CascadeMode, RestartPolicyKind, ServiceId};

/// Why a stop was issued; decides the state the service lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPurpose {
    /// Requested through the control surface.
    Operator,
    /// A dependency reached `FAILED` and cascade-stop is enabled.
    Cascade,
    /// The service itself reached `FAILED`; its process is cleaned up.
    Teardown,
    /// The previous instance is removed before a retry.
    Restart,
    /// The service disappeared from the manifest on reload.
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedStop {
    force: bool,
    purpose: StopPurpose,
}

/// Inputs to the core.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StartRequested {
        services: Vec<ServiceId>,
        correlation: Uuid,
    },
    StopRequested {
        services: Vec<ServiceId>,
        force: bool,
        correlation: Uuid,
    },
    StartFinished {
        service: ServiceId,
        epoch: u64,
        result: Result<(), String>,
    },
    StopFinished {
        service: ServiceId,
        epoch: u64,
        result: Result<(), String>,
    },
    Probed {
        service: ServiceId,
        epoch: u64,
        healthy: bool,
        latency: Duration,
        detail: String,
    },
    Exited {
        service: ServiceId,
        epoch: u64,
        clean: Option<bool>,
    },
    RetryDue {
        service: ServiceId,
        token: u64,
    },
    EnvironmentChanged {
        env: BTreeMap<String, String>,
    },
    Reloaded {
        manifest: Manifest,
    },
}

/// Work the IO shell performs on behalf of the core.
#[derive(Debug, Clone)]
pub enum SupervisorCommand {
    Start {
        service: ServiceId,
        epoch: u64,
        definition: Arc<ServiceDefinition>,
        env: BTreeMap<String, String>,
    },
    Stop {
        service: ServiceId,
        epoch: u64,
        force: bool,
    },
    ScheduleRetry {
        service: ServiceId,
        token: u64,
        delay: Duration,
    },
    CancelRetry {
        service: ServiceId,
    },
    Monitor {
        service: ServiceId,
        epoch: u64,
        definition: Arc<ServiceDefinition>,
    },
    Unmonitor {
        service: ServiceId,
    },
    /// The service left the manifest; drop its handle.
    Forget {
        service: ServiceId,
    },
}

/// A state change to be recorded as an audit event.
///
/// `from == to` marks a change of the degraded flag only.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub service: ServiceId,
    pub from: ServiceState,
    pub to: ServiceState,
    pub degraded: bool,
    pub correlation: Uuid,
    pub detail: String,
}

/// Result of handling one event.
#[derive(Debug, Clone, Default)]
pub struct CoreStep {
    pub commands: Vec<SupervisorCommand>,
    pub transitions: Vec<Transition>,
}

impl CoreStep {
    fn progress(&self) -> (usize, usize) {
        (self.commands.len(), self.transitions.len())
    }
}

#[derive(Debug)]
pub struct SupervisorCore {
    manifest: Manifest,
    graph: DependencyGraph,
    env: BTreeMap<String, String>,
    instances: BTreeMap<ServiceId, ServiceInstance>,
    /// Stops waiting for their dependents to go down first.
    stop_queue: BTreeMap<ServiceId, QueuedStop>,
    /// Stops that arrived while `start` was in flight.
    deferred_stops: BTreeMap<ServiceId, QueuedStop>,
    /// Purpose of every stop currently in flight.
    stopping: BTreeMap<ServiceId, StopPurpose>,
}

impl SupervisorCore {
    pub fn new(manifest: Manifest, env: BTreeMap<String, String>) -> Self {
        let graph = DependencyGraph::from_manifest(&manifest);
        let instances = manifest
            .ids()
            .map(|id| (id.to_string(), ServiceInstance::new(id)))
            .collect();

        Self {
            manifest,
            graph,
            env,
            instances,
            stop_queue: BTreeMap::new(),
            deferred_stops: BTreeMap::new(),
            stopping: BTreeMap::new(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn instance(&self, id: &str) -> Option<&ServiceInstance> {
        self.instances.get(id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.instances.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn snapshots(&self) -> Vec<StateSnapshot> {
        self.instances
            .values()
            .filter_map(|inst| {
                let mode = self.manifest.service(&inst.id)?.mode();
                Some(StateSnapshot::from_instance(inst, mode))
            })
            .collect()
    }

    /// `HEALTHY`, or `RUNNING` without a declared health check.
    pub fn is_ready(&self, id: &str) -> bool {
        let Some(inst) = self.instances.get(id) else {
            return false;
        };
        match inst.state {
            ServiceState::Healthy => true,
            ServiceState::Running => self
                .manifest
                .service(id)
                .is_some_and(|def| def.health.is_none()),
            _ => false,
        }
    }

    /// Transitive dependencies of `id` that are not ready.
    pub fn unready_dependencies(&self, id: &str) -> Vec<ServiceId> {
        self.graph
            .transitive_dependencies(id)
            .into_iter()
            .filter(|dep| !self.is_ready(dep))
            .collect()
    }

    /// Nothing in flight, queued or scheduled for any service.
    pub fn is_quiescent(&self) -> bool {
        self.stop_queue.is_empty()
            && self.deferred_stops.is_empty()
            && self.instances.values().all(ServiceInstance::is_settled)
    }

    /// Settled outcome of a start request for `id`, or `None` while it is
    /// still in progress.
    pub fn start_outcome(&self, id: &str) -> Option<crate::errors::Result<ServiceState>> {
        let Some(inst) = self.instances.get(id) else {
            return Some(Err(LaunchError::UnknownService(id.to_string())));
        };
        if self.is_ready(id) {
            return Some(Ok(inst.state));
        }
        match inst.state {
            ServiceState::Failed => {
                let missing = self
                    .manifest
                    .service(id)
                    .map(|def| def.missing_required_env(&self.env))
                    .unwrap_or_default();
                if !missing.is_empty() {
                    return Some(Err(LaunchError::RequiredEnv {
                        service: id.to_string(),
                        missing,
                    }));
                }
                Some(Err(LaunchError::ServiceFailed {
                    service: id.to_string(),
                    reason: inst
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "service failed".to_string()),
                }))
            }
            ServiceState::Stopped | ServiceState::Stopping if !inst.wanted => {
                Some(Err(LaunchError::ServiceFailed {
                    service: id.to_string(),
                    reason: if inst.unexpected_stop {
                        "process exited before becoming ready".to_string()
                    } else {
                        "stopped before becoming ready".to_string()
                    },
                }))
            }
            _ => None,
        }
    }

    /// Error reported for a start request that did not settle in time.
    pub fn start_timeout_error(&self, id: &str, elapsed: Duration) -> LaunchError {
        match self.instances.get(id) {
            Some(inst) if inst.state == ServiceState::Pending => LaunchError::DependencyUnmet {
                service: id.to_string(),
                waiting_on: self.unready_dependencies(id),
            },
            Some(_) => LaunchError::Timeout {
                service: id.to_string(),
                operation: "start",
                elapsed,
            },
            None => LaunchError::UnknownService(id.to_string()),
        }
    }

    /// Settled outcome of a stop request for `id`.
    pub fn stop_outcome(&self, id: &str) -> Option<crate::errors::Result<ServiceState>> {
        let Some(inst) = self.instances.get(id) else {
            // Removed by a reload while stopping.
            return Some(Ok(ServiceState::Stopped));
        };
        let queued = self.stop_queue.contains_key(id) || self.deferred_stops.contains_key(id);
        let settled = inst.in_flight.is_none() && !queued;
        match inst.state {
            ServiceState::Stopped | ServiceState::Failed | ServiceState::Pending if settled => {
                Some(Ok(inst.state))
            }
            _ => None,
        }
    }

    /// Handle one event and return what the shell must do.
    pub fn step(&mut self, event: SupervisorEvent) -> CoreStep {
        let mut step = CoreStep::default();

        match event {
            SupervisorEvent::StartRequested {
                services,
                correlation,
            } => self.on_start_requested(&mut step, &services, correlation),
            SupervisorEvent::StopRequested {
                services,
                force,
                correlation,
            } => self.on_stop_requested(&mut step, &services, force, correlation),
            SupervisorEvent::StartFinished {
                service,
                epoch,
                result,
            } => self.on_start_finished(&mut step, &service, epoch, result),
            SupervisorEvent::StopFinished {
                service,
                epoch,
                result,
            } => self.on_stop_finished(&mut step, &service, epoch, result),
            SupervisorEvent::Probed {
                service,
                epoch,
                healthy,
                latency,
                detail,
            } => self.on_probed(&mut step, &service, epoch, healthy, latency, detail),
            SupervisorEvent::Exited {
                service,
                epoch,
                clean,
            } => self.on_exited(&mut step, &service, epoch, clean),
            SupervisorEvent::RetryDue { service, token } => {
                self.on_retry_due(&mut step, &service, token)
            }
            SupervisorEvent::EnvironmentChanged { env } => {
                debug!(vars = env.len(), "resolved environment replaced");
                self.env = env;
            }
            SupervisorEvent::Reloaded { manifest } => self.on_reloaded(&mut step, manifest),
        }

        self.reconcile(&mut step);
        step
    }

    // ---------------------------------------------------------------------
    // Event handlers
    // ---------------------------------------------------------------------

    fn on_start_requested(&mut self, step: &mut CoreStep, services: &[ServiceId], correlation: Uuid) {
        let targets = self.graph.with_dependencies(services.iter().map(String::as_str));
        info!(requested = ?services, expanded = ?targets, %correlation, "start requested");

        for id in targets {
            self.stop_queue.remove(&id);
            let resumed = self.deferred_stops.remove(&id).is_some();

            let Some(inst) = self.instances.get_mut(&id) else {
                continue;
            };
            inst.wanted = true;
            inst.correlation = correlation;
            let state = inst.state;

            match state {
                ServiceState::Failed | ServiceState::Stopped => {
                    inst.retries = 0;
                    inst.unexpected_stop = false;
                    self.transition(step, &id, ServiceState::Pending, "start requested");
                }
                ServiceState::Stopping if resumed => {
                    self.transition(step, &id, ServiceState::Starting, "stop withdrawn by start request");
                }
                _ => {
                    debug!(service = %id, %state, "start request needs no action");
                }
            }
        }
    }

    fn on_stop_requested(
        &mut self,
        step: &mut CoreStep,
        services: &[ServiceId],
        force: bool,
        correlation: Uuid,
    ) {
        let targets = self.graph.with_dependents(services.iter().map(String::as_str));
        info!(requested = ?services, expanded = ?targets, force, %correlation, "stop requested");

        for id in targets {
            let Some(inst) = self.instances.get_mut(&id) else {
                continue;
            };
            inst.wanted = false;
            inst.correlation = correlation;
            self.cancel_retry(step, &id);

            let inst = &self.instances[&id];
            let (in_flight, state, has_handle, epoch) =
                (inst.in_flight, inst.state, inst.has_handle, inst.epoch);
            match (in_flight, state) {
                (Some(InFlight::Stop), _) => {
                    if self.stopping.get(&id) == Some(&StopPurpose::Restart) {
                        self.stopping.insert(id.clone(), StopPurpose::Operator);
                        self.transition(step, &id, ServiceState::Stopping, "stop requested while restarting");
                    }
                    if force {
                        step.commands.push(SupervisorCommand::Stop {
                            service: id.clone(),
                            epoch,
                            force: true,
                        });
                    }
                }
                (None, ServiceState::Failed) if !has_handle => {}
                (None, ServiceState::Pending) if !has_handle => {
                    self.transition(step, &id, ServiceState::Stopped, "stop requested");
                }
                (None, ServiceState::Stopped) => {}
                _ => self.enqueue_stop(&id, force, StopPurpose::Operator),
            }
        }
    }

    fn on_start_finished(
        &mut self,
        step: &mut CoreStep,
        id: &str,
        epoch: u64,
        result: Result<(), String>,
    ) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        if inst.epoch != epoch || inst.in_flight != Some(InFlight::Start) {
            debug!(service = %id, epoch, current = inst.epoch, "ignoring stale start result");
            return;
        }
        inst.in_flight = None;
        let deferred = self.deferred_stops.remove(id);

        match result {
            Ok(()) => {
                inst.has_handle = true;
                if let Some(stop) = deferred {
                    self.dispatch_stop(step, id, stop.force, stop.purpose);
                    return;
                }

                inst.consecutive_probe_failures = 0;
                inst.running_since = Some(Utc::now());
                let definition = self.manifest.service(id).cloned();
                let epoch = inst.epoch;

                self.transition(step, id, ServiceState::Running, "adapter start succeeded");
                if let Some(definition) = definition {
                    step.commands.push(SupervisorCommand::Monitor {
                        service: id.to_string(),
                        epoch,
                        definition,
                    });
                }
            }
            Err(message) => {
                inst.has_handle = false;
                inst.last_error = Some(message.clone());
                if let Some(stop) = deferred {
                    self.finish_stop_without_handle(step, id, stop.purpose);
                    return;
                }
                self.on_failure(step, id, format!("start failed: {message}"));
            }
        }
    }

    fn on_stop_finished(
        &mut self,
        step: &mut CoreStep,
        id: &str,
        epoch: u64,
        result: Result<(), String>,
    ) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        if inst.epoch != epoch || inst.in_flight != Some(InFlight::Stop) {
            debug!(service = %id, epoch, current = inst.epoch, "ignoring stale stop result");
            return;
        }
        inst.in_flight = None;
        inst.has_handle = false;
        inst.running_since = None;
        if let Err(e) = result {
            warn!(service = %id, error = %e, "stop reported an error; treating service as stopped");
            inst.last_error = Some(format!("stop failed: {e}"));
        }

        let purpose = self.stopping.remove(id).unwrap_or(StopPurpose::Operator);
        match purpose {
            StopPurpose::Restart => {
                if self.instances[id].state == ServiceState::Restarting {
                    self.restart_or_wait(step, id);
                }
            }
            other => self.finish_stop_without_handle(step, id, other),
        }
    }

    fn on_probed(
        &mut self,
        step: &mut CoreStep,
        id: &str,
        epoch: u64,
        healthy: bool,
        latency: Duration,
        detail: String,
    ) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        if inst.epoch != epoch || !inst.has_handle || inst.in_flight.is_some() {
            return;
        }
        inst.last_probe_latency = Some(latency);

        if healthy {
            inst.consecutive_probe_failures = 0;
            let state = inst.state;
            match state {
                ServiceState::Running => {
                    self.transition(step, id, ServiceState::Healthy, format!("probe ok: {detail}"));
                }
                ServiceState::Unhealthy => {
                    self.cancel_retry(step, id);
                    self.transition(
                        step,
                        id,
                        ServiceState::Healthy,
                        format!("recovered without restart: {detail}"),
                    );
                }
                _ => {}
            }
            return;
        }

        inst.consecutive_probe_failures += 1;
        let failures = inst.consecutive_probe_failures;
        let state = inst.state;
        let threshold = self
            .manifest
            .service(id)
            .and_then(|d| d.health.as_ref())
            .map(|h| h.failure_threshold)
            .unwrap_or(1);

        debug!(service = %id, failures, threshold, %detail, "health probe failed");
        if matches!(state, ServiceState::Running | ServiceState::Healthy) && failures >= threshold {
            self.on_failure(
                step,
                id,
                format!("{failures} consecutive failed probes; last: {detail}"),
            );
        }
    }

    fn on_exited(&mut self, step: &mut CoreStep, id: &str, epoch: u64, clean: Option<bool>) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        if inst.epoch != epoch || !inst.has_handle || inst.in_flight.is_some() {
            return;
        }
        inst.has_handle = false;
        inst.running_since = None;
        let already_retrying = inst.state == ServiceState::Unhealthy && inst.retry_pending;
        step.commands.push(SupervisorCommand::Unmonitor {
            service: id.to_string(),
        });
        if already_retrying {
            return;
        }

        let always = self
            .manifest
            .service(id)
            .is_some_and(|d| d.restart.kind == RestartPolicyKind::Always);

        match clean {
            Some(true) if !always => {
                inst.unexpected_stop = true;
                inst.wanted = false;
                self.cancel_retry(step, id);
                self.transition(step, id, ServiceState::Stopped, "process exited cleanly");
            }
            Some(true) => self.on_failure(step, id, "process exited".to_string()),
            Some(false) => self.on_failure(step, id, "process exited with failure".to_string()),
            None => self.on_failure(step, id, "service is no longer alive".to_string()),
        }
    }

    fn on_retry_due(&mut self, step: &mut CoreStep, id: &str, token: u64) {
        let budget = self.retry_budget(id);
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        if !inst.retry_pending || inst.retry_token != token {
            return;
        }
        inst.retry_pending = false;
        if !inst.wanted || inst.state != ServiceState::Unhealthy {
            return;
        }

        inst.restart_count += 1;
        inst.retries += 1;
        let has_handle = inst.has_handle;
        let detail = format!("retry {}/{}", inst.retries, budget);

        self.transition(step, id, ServiceState::Restarting, detail);
        if has_handle {
            self.dispatch_stop(step, id, true, StopPurpose::Restart);
        } else {
            self.restart_or_wait(step, id);
        }
    }

    fn on_reloaded(&mut self, step: &mut CoreStep, manifest: Manifest) {
        let removed: Vec<ServiceId> = self
            .instances
            .keys()
            .filter(|id| !manifest.contains(id))
            .cloned()
            .collect();
        let added: Vec<ServiceId> = manifest
            .ids()
            .filter(|id| !self.instances.contains_key(*id))
            .map(str::to_string)
            .collect();

        info!(?added, ?removed, "manifest reloaded");

        for id in &removed {
            self.cancel_retry(step, id);
            self.deferred_stops.remove(id);
            self.stop_queue.remove(id);
            let Some(inst) = self.instances.get_mut(id) else {
                continue;
            };
            inst.wanted = false;
            if inst.has_handle || inst.in_flight.is_some() {
                self.enqueue_stop(id, false, StopPurpose::Remove);
            } else {
                self.forget(step, id);
            }
        }

        for id in added {
            self.instances.insert(id.clone(), ServiceInstance::new(id));
        }

        self.graph = DependencyGraph::from_manifest(&manifest);
        self.manifest = manifest;
    }

    // ---------------------------------------------------------------------
    // Decisions
    // ---------------------------------------------------------------------

    fn retry_budget(&self, id: &str) -> u32 {
        self.manifest
            .service(id)
            .map(|d| {
                d.restart
                    .max_retries
                    .effective(self.manifest.settings().retry_ceiling)
            })
            .unwrap_or(0)
    }

    /// A start failed, the process crashed, or probes crossed the threshold.
    fn on_failure(&mut self, step: &mut CoreStep, id: &str, reason: String) {
        let budget = self.retry_budget(id);
        let policy = self.manifest.service(id).map(|d| d.restart);
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        inst.last_error = Some(reason.clone());
        inst.consecutive_probe_failures = 0;
        if inst.state != ServiceState::Unhealthy {
            inst.correlation = Uuid::new_v4();
        }

        let Some(policy) = policy else {
            self.fail(step, id, reason);
            return;
        };

        if policy.kind == RestartPolicyKind::Never {
            self.fail(step, id, format!("{reason}; restart policy is never"));
            return;
        }
        // Recovering in between does not refill the budget; only an
        // operator start does.
        if inst.retries >= budget {
            let used = inst.retries;
            self.fail(
                step,
                id,
                format!("{reason}; retry budget exhausted ({used}/{budget})"),
            );
            return;
        }
        if !inst.wanted {
            let to = if inst.has_handle {
                ServiceState::Unhealthy
            } else {
                ServiceState::Stopped
            };
            self.transition(step, id, to, format!("{reason}; not restarting, stop requested"));
            return;
        }

        let delay = policy.backoff.delay(inst.retries);
        inst.retry_pending = true;
        inst.retry_token += 1;
        let token = inst.retry_token;
        let attempt = inst.retries + 1;

        step.commands.push(SupervisorCommand::ScheduleRetry {
            service: id.to_string(),
            token,
            delay,
        });
        self.transition(
            step,
            id,
            ServiceState::Unhealthy,
            format!("{reason}; retry {attempt}/{budget} in {delay:?}"),
        );
    }

    /// Terminal failure, plus cascade to dependents.
    fn fail(&mut self, step: &mut CoreStep, id: &str, reason: String) {
        self.cancel_retry(step, id);
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        inst.last_error = Some(reason.clone());
        let needs_teardown = inst.has_handle || inst.in_flight == Some(InFlight::Start);

        self.transition(step, id, ServiceState::Failed, reason);
        step.commands.push(SupervisorCommand::Unmonitor {
            service: id.to_string(),
        });
        if needs_teardown {
            self.enqueue_stop(id, false, StopPurpose::Teardown);
        }

        let dependents = self.graph.transitive_dependents(id);
        if dependents.is_empty() {
            return;
        }

        warn!(
            service = %id,
            dependents = ?dependents,
            cascade = ?self.manifest.settings().cascade,
            "service failed; cascading to dependents"
        );

        if self.manifest.settings().cascade == CascadeMode::Stop {
            for dep in dependents {
                let Some(d) = self.instances.get(&dep) else {
                    continue;
                };
                let active = d.has_handle
                    || d.in_flight == Some(InFlight::Start)
                    || matches!(
                        d.state,
                        ServiceState::Starting
                            | ServiceState::Running
                            | ServiceState::Healthy
                            | ServiceState::Unhealthy
                            | ServiceState::Restarting
                    );
                if active && !self.stop_queue.contains_key(&dep) {
                    self.cancel_retry(step, &dep);
                    self.enqueue_stop(&dep, false, StopPurpose::Cascade);
                }
            }
        }
    }

    fn restart_or_wait(&mut self, step: &mut CoreStep, id: &str) {
        let Some(inst) = self.instances.get(id) else {
            return;
        };
        if !inst.wanted {
            self.transition(step, id, ServiceState::Stopped, "stopped before restart");
            return;
        }
        let degraded = inst.degraded;
        if !degraded && self.dependencies_ready(id) {
            self.dispatch_start(step, id);
        } else {
            self.transition(step, id, ServiceState::Pending, "waiting for dependencies");
        }
    }

    fn dependencies_ready(&self, id: &str) -> bool {
        self.graph
            .dependencies_of(id)
            .iter()
            .all(|dep| self.is_ready(dep))
    }

    fn dispatch_start(&mut self, step: &mut CoreStep, id: &str) {
        let Some(definition) = self.manifest.service(id).cloned() else {
            return;
        };

        // The environment may have changed since validation.
        let missing = definition.missing_required_env(&self.env);
        if !missing.is_empty() {
            self.fail(
                step,
                id,
                format!("required environment variables missing: {}", missing.join(", ")),
            );
            return;
        }

        let env = definition.propagated_env(&self.env);
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        inst.epoch += 1;
        inst.in_flight = Some(InFlight::Start);
        inst.consecutive_probe_failures = 0;
        let epoch = inst.epoch;

        self.transition(step, id, ServiceState::Starting, format!("dispatching {} adapter", definition.mode()));
        step.commands.push(SupervisorCommand::Start {
            service: id.to_string(),
            epoch,
            definition,
            env,
        });
    }

    fn dispatch_stop(&mut self, step: &mut CoreStep, id: &str, force: bool, purpose: StopPurpose) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        inst.epoch += 1;
        inst.in_flight = Some(InFlight::Stop);
        let epoch = inst.epoch;
        let state = inst.state;
        self.stopping.insert(id.to_string(), purpose);

        if matches!(
            purpose,
            StopPurpose::Operator | StopPurpose::Cascade | StopPurpose::Remove
        ) && state != ServiceState::Failed
        {
            let detail = match purpose {
                StopPurpose::Cascade => "dependency failed; cascade stop",
                StopPurpose::Remove => "removed from manifest",
                _ => "stop requested",
            };
            self.transition(step, id, ServiceState::Stopping, detail);
        }

        step.commands.push(SupervisorCommand::Unmonitor {
            service: id.to_string(),
        });
        step.commands.push(SupervisorCommand::Stop {
            service: id.to_string(),
            epoch,
            force,
        });
    }

    fn finish_stop_without_handle(&mut self, step: &mut CoreStep, id: &str, purpose: StopPurpose) {
        match purpose {
            StopPurpose::Remove => self.forget(step, id),
            StopPurpose::Teardown => {}
            StopPurpose::Restart => self.restart_or_wait(step, id),
            StopPurpose::Operator | StopPurpose::Cascade => {
                let state = self.instances.get(id).map(|i| i.state);
                if !matches!(state, Some(ServiceState::Failed) | None) {
                    let detail = if purpose == StopPurpose::Cascade {
                        "stopped after dependency failure"
                    } else {
                        "stopped"
                    };
                    self.transition(step, id, ServiceState::Stopped, detail);
                }
            }
        }
    }

    fn enqueue_stop(&mut self, id: &str, force: bool, purpose: StopPurpose) {
        self.stop_queue
            .entry(id.to_string())
            .and_modify(|q| {
                q.force |= force;
                if purpose == StopPurpose::Operator || purpose == StopPurpose::Remove {
                    q.purpose = purpose;
                }
            })
            .or_insert(QueuedStop { force, purpose });
    }

    fn cancel_retry(&mut self, step: &mut CoreStep, id: &str) {
        if let Some(inst) = self.instances.get_mut(id) {
            if inst.retry_pending {
                inst.retry_pending = false;
                step.commands.push(SupervisorCommand::CancelRetry {
                    service: id.to_string(),
                });
            }
        }
    }

    fn forget(&mut self, step: &mut CoreStep, id: &str) {
        self.instances.remove(id);
        self.stopping.remove(id);
        step.commands.push(SupervisorCommand::Unmonitor {
            service: id.to_string(),
        });
        step.commands.push(SupervisorCommand::Forget {
            service: id.to_string(),
        });
    }

    fn transition(
        &mut self,
        step: &mut CoreStep,
        id: &str,
        to: ServiceState,
        detail: impl Into<String>,
    ) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        let from = inst.state;
        if from == to {
            return;
        }
        inst.state = to;

        let now = Utc::now();
        match to {
            ServiceState::Healthy | ServiceState::Unhealthy => inst.last_health_change_at = Some(now),
            ServiceState::Running => inst.running_since = Some(now),
            ServiceState::Stopped | ServiceState::Failed | ServiceState::Pending => {
                inst.running_since = None
            }
            _ => {}
        }

        step.transitions.push(Transition {
            service: id.to_string(),
            from,
            to,
            degraded: inst.degraded,
            correlation: inst.correlation,
            detail: detail.into(),
        });
    }

    // ---------------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------------

    /// Apply derived consequences until nothing changes: degraded flags,
    /// queued stops whose dependents are down, and starts whose
    /// dependencies are ready.
    fn reconcile(&mut self, step: &mut CoreStep) {
        let max_rounds = self.instances.len() * 4 + 4;
        for _ in 0..max_rounds {
            let before = step.progress();
            self.refresh_degraded(step);
            self.drain_stop_queue(step);
            self.dispatch_ready(step);
            if step.progress() == before {
                return;
            }
        }
        warn!("reconcile did not settle; continuing on next event");
    }

    fn refresh_degraded(&mut self, step: &mut CoreStep) {
        let broken: BTreeSet<ServiceId> = self
            .instances
            .values()
            .filter(|i| i.is_broken())
            .map(|i| i.id.clone())
            .collect();

        let ids: Vec<ServiceId> = self.instances.keys().cloned().collect();
        for id in ids {
            let culprits: Vec<ServiceId> = self
                .graph
                .transitive_dependencies(&id)
                .into_iter()
                .filter(|d| broken.contains(d))
                .collect();
            let Some(inst) = self.instances.get_mut(&id) else {
                continue;
            };
            let degraded = !culprits.is_empty();
            if inst.degraded == degraded {
                continue;
            }
            inst.degraded = degraded;

            let detail = if degraded {
                format!("degraded: dependency failed or stopped ({})", culprits.join(", "))
            } else {
                "dependencies recovered; no longer degraded".to_string()
            };
            step.transitions.push(Transition {
                service: id.clone(),
                from: inst.state,
                to: inst.state,
                degraded,
                correlation: inst.correlation,
                detail,
            });
        }
    }

    /// Dispatch queued stops whose dependents are all down.
    fn drain_stop_queue(&mut self, step: &mut CoreStep) {
        let ready: Vec<ServiceId> = self
            .stop_queue
            .keys()
            .filter(|id| self.dependents_quiet(id))
            .cloned()
            .collect();

        for id in ready {
            let Some(queued) = self.stop_queue.remove(&id) else {
                continue;
            };
            let Some(inst) = self.instances.get(&id) else {
                continue;
            };
            let (in_flight, state, has_handle, epoch) =
                (inst.in_flight, inst.state, inst.has_handle, inst.epoch);

            match in_flight {
                Some(InFlight::Start) => {
                    self.deferred_stops.insert(id.clone(), queued);
                    if state != ServiceState::Failed {
                        self.transition(step, &id, ServiceState::Stopping, "stop requested while starting");
                    }
                }
                Some(InFlight::Stop) => {
                    if queued.force {
                        step.commands.push(SupervisorCommand::Stop {
                            service: id.clone(),
                            epoch,
                            force: true,
                        });
                    }
                }
                None if has_handle => self.dispatch_stop(step, &id, queued.force, queued.purpose),
                None => self.finish_stop_without_handle(step, &id, queued.purpose),
            }
        }
    }

    fn dependents_quiet(&self, id: &str) -> bool {
        self.graph.transitive_dependents(id).iter().all(|dep| {
            let stopping = self.stopping.get(dep).is_some_and(|p| *p != StopPurpose::Restart);
            !self.stop_queue.contains_key(dep) && !self.deferred_stops.contains_key(dep) && !stopping
        })
    }

    fn dispatch_ready(&mut self, step: &mut CoreStep) {
        for id in self.graph.start_order() {
            let Some(inst) = self.instances.get(&id) else {
                continue;
            };
            let eligible = inst.wanted
                && !inst.degraded
                && inst.in_flight.is_none()
                && !inst.retry_pending
                && matches!(inst.state, ServiceState::Pending | ServiceState::Stopped)
                && !self.stop_queue.contains_key(&id);

            if eligible && self.dependencies_ready(&id) {
                self.dispatch_start(step, &id);
            }
        }
    }
}
