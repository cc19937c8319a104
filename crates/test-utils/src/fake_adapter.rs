#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use launchvisor::exec::{
    AdapterFuture, AdapterRegistry, ExecutionAdapter, ProbeResult, ServiceHandle, StartContext,
};
use launchvisor::manifest::HealthCheck;
use launchvisor::types::{ExecutionMode, ServiceId};

#[derive(Debug, Clone)]
struct FakeInstance {
    service: ServiceId,
    alive: bool,
    /// How the instance ended; `None` while alive or if killed by `stop`.
    clean_exit: Option<bool>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Remaining scripted start failures per service.
    fail_next: HashMap<ServiceId, u32>,
    fail_always: HashMap<ServiceId, String>,
    /// Scripted probe outcomes, consumed front to back.
    probe_script: HashMap<ServiceId, VecDeque<bool>>,
    /// Outcome once the script runs out; healthy if unset.
    probe_default: HashMap<ServiceId, bool>,
    instances: HashMap<u64, FakeInstance>,
    start_calls: HashMap<ServiceId, u32>,
    spawned: HashMap<ServiceId, u32>,
    spawn_order: Vec<ServiceId>,
    stops: Vec<(ServiceId, bool)>,
    start_delay: Option<Duration>,
    stop_delay: Option<Duration>,
}

/// A fake adapter that:
/// - "spawns" detached handles instantly (or after a configurable delay)
/// - fails starts and probes according to a per-service script
/// - records every start and stop call for assertions
/// - lets tests crash a running service from the outside
#[derive(Debug, Clone, Default)]
pub struct FakeAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with this adapter for every execution mode.
    pub fn registry(&self) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for mode in ExecutionMode::ALL {
            registry.register(mode, Arc::new(self.clone()));
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// The next `n` starts of `service` fail.
    pub fn fail_next_starts(&self, service: &str, n: u32) {
        self.lock().fail_next.insert(service.to_string(), n);
    }

    /// Every start of `service` fails with `message`.
    pub fn fail_all_starts(&self, service: &str, message: &str) {
        self.lock()
            .fail_always
            .insert(service.to_string(), message.to_string());
    }

    pub fn clear_failures(&self, service: &str) {
        let mut inner = self.lock();
        inner.fail_next.remove(service);
        inner.fail_always.remove(service);
    }

    /// Queue probe outcomes for `service`.
    pub fn script_probes(&self, service: &str, outcomes: &[bool]) {
        self.lock()
            .probe_script
            .entry(service.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    /// Probe outcome used once the script is exhausted.
    pub fn set_default_probe(&self, service: &str, healthy: bool) {
        self.lock()
            .probe_default
            .insert(service.to_string(), healthy);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.lock().start_delay = Some(delay);
    }

    /// Delay applied to graceful stops only.
    pub fn set_stop_delay(&self, delay: Duration) {
        self.lock().stop_delay = Some(delay);
    }

    /// Make every live instance of `service` exit.
    pub fn crash(&self, service: &str, clean: bool) {
        let mut inner = self.lock();
        for instance in inner.instances.values_mut() {
            if instance.service == service && instance.alive {
                instance.alive = false;
                instance.clean_exit = Some(clean);
            }
        }
    }

    /// Number of `start` calls that created a new instance.
    pub fn spawn_count(&self, service: &str) -> u32 {
        self.lock().spawned.get(service).copied().unwrap_or(0)
    }

    /// Number of `start` calls, including failed and reused ones.
    pub fn start_calls(&self, service: &str) -> u32 {
        self.lock().start_calls.get(service).copied().unwrap_or(0)
    }

    /// Services in the order their instances were created.
    pub fn spawn_order(&self) -> Vec<ServiceId> {
        self.lock().spawn_order.clone()
    }

    /// `(service, force)` for every stop call, in call order.
    pub fn stops(&self) -> Vec<(ServiceId, bool)> {
        self.lock().stops.clone()
    }

    pub fn stop_order(&self) -> Vec<ServiceId> {
        self.lock().stops.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn live_instances(&self, service: &str) -> usize {
        self.lock()
            .instances
            .values()
            .filter(|i| i.service == service && i.alive)
            .count()
    }

    fn is_live(&self, handle: &ServiceHandle) -> bool {
        self.lock()
            .instances
            .get(&handle.instance())
            .is_some_and(|i| i.alive)
    }
}

impl ExecutionAdapter for FakeAdapter {
    fn start(&self, ctx: StartContext) -> AdapterFuture<'_, anyhow::Result<ServiceHandle>> {
        Box::pin(async move {
            let service = ctx.service().to_string();
            let delay = {
                let mut inner = self.lock();
                *inner.start_calls.entry(service.clone()).or_default() += 1;
                inner.start_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(existing) = ctx.existing {
                if self.is_live(&existing) {
                    return Ok(existing);
                }
            }

            let mut inner = self.lock();
            if let Some(message) = inner.fail_always.get(&service) {
                anyhow::bail!("{message}");
            }
            if let Some(remaining) = inner.fail_next.get_mut(&service) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("scripted start failure");
                }
            }

            let handle = ServiceHandle::detached(service.clone());
            inner.instances.insert(
                handle.instance(),
                FakeInstance {
                    service: service.clone(),
                    alive: true,
                    clean_exit: None,
                },
            );
            *inner.spawned.entry(service.clone()).or_default() += 1;
            inner.spawn_order.push(service);
            Ok(handle)
        })
    }

    fn stop<'a>(
        &'a self,
        handle: &'a ServiceHandle,
        force: bool,
    ) -> AdapterFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let delay = {
                let mut inner = self.lock();
                inner.stops.push((handle.service().to_string(), force));
                inner.stop_delay
            };
            if let (Some(delay), false) = (delay, force) {
                tokio::time::sleep(delay).await;
            }
            if let Some(instance) = self.lock().instances.get_mut(&handle.instance()) {
                instance.alive = false;
            }
            Ok(())
        })
    }

    fn probe<'a>(
        &'a self,
        handle: &'a ServiceHandle,
        _check: &'a HealthCheck,
    ) -> AdapterFuture<'a, ProbeResult> {
        Box::pin(async move {
            let service = handle.service();
            let mut inner = self.lock();
            let scripted = inner
                .probe_script
                .get_mut(service)
                .and_then(|q| q.pop_front());
            let healthy = scripted
                .or_else(|| inner.probe_default.get(service).copied())
                .unwrap_or(true);

            let latency = Duration::from_millis(1);
            if healthy {
                ProbeResult::healthy(latency, "fake probe ok")
            } else {
                ProbeResult::unhealthy(latency, "fake probe failed")
            }
        })
    }

    fn is_alive<'a>(&'a self, handle: &'a ServiceHandle) -> AdapterFuture<'a, bool> {
        Box::pin(async move { self.is_live(handle) })
    }

    fn exited_cleanly(&self, handle: &ServiceHandle) -> Option<bool> {
        self.lock()
            .instances
            .get(&handle.instance())
            .and_then(|i| i.clean_exit)
    }
}
