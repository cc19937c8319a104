// src/health/monitor.rs

//! One background task per running service.
//!
//! Each task polls `is_alive` on the liveness interval and, if the service
//! declares a health check, probes it on the check's own interval. Results
//! go back to the supervisor as [`MonitorReport`]s; the monitor itself
//! makes no decisions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::exec::{ExecutionAdapter, ProbeResult, ServiceHandle};
use crate::manifest::HealthCheck;
use crate::supervisor::pool::WorkerPool;
use crate::types::ServiceId;

/// Observation sent from a monitor task to the supervisor.
#[derive(Debug, Clone)]
pub enum MonitorReport {
    Probed {
        service: ServiceId,
        epoch: u64,
        result: ProbeResult,
    },
    /// `is_alive` returned false. The task ends after sending this.
    Exited {
        service: ServiceId,
        epoch: u64,
        clean: Option<bool>,
    },
}

/// What one monitor task watches.
pub struct Watch {
    pub service: ServiceId,
    pub epoch: u64,
    pub handle: ServiceHandle,
    pub check: Option<HealthCheck>,
    pub adapter: Arc<dyn ExecutionAdapter>,
}

#[derive(Debug)]
pub struct HealthMonitor {
    pool: WorkerPool,
    liveness_interval: Duration,
    call_timeout: Duration,
    reports: mpsc::UnboundedSender<MonitorReport>,
    tasks: HashMap<ServiceId, JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(
        pool: WorkerPool,
        liveness_interval: Duration,
        call_timeout: Duration,
        reports: mpsc::UnboundedSender<MonitorReport>,
    ) -> Self {
        Self {
            pool,
            liveness_interval,
            call_timeout,
            reports,
            tasks: HashMap::new(),
        }
    }

    /// Start watching a service, replacing any previous watch for it.
    pub fn watch(&mut self, watch: Watch) {
        let service = watch.service.clone();
        self.unwatch(&service);

        debug!(
            service = %service,
            epoch = watch.epoch,
            probes = watch.check.is_some(),
            "health monitor watching service"
        );

        let task = tokio::spawn(monitor_loop(
            watch,
            self.pool.clone(),
            self.liveness_interval,
            self.call_timeout,
            self.reports.clone(),
        ));
        self.tasks.insert(service, task);
    }

    pub fn unwatch(&mut self, service: &str) {
        if let Some(task) = self.tasks.remove(service) {
            task.abort();
            debug!(service = %service, "health monitor stopped watching service");
        }
    }

    pub fn unwatch_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.unwatch_all();
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_probe(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn monitor_loop(
    watch: Watch,
    pool: WorkerPool,
    liveness_interval: Duration,
    call_timeout: Duration,
    reports: mpsc::UnboundedSender<MonitorReport>,
) {
    let Watch {
        service,
        epoch,
        handle,
        check,
        adapter,
    } = watch;

    let mut liveness = ticker(liveness_interval);
    // The first liveness tick would fire immediately; the start call just
    // proved the service alive.
    liveness.reset();
    let mut probes = check.as_ref().map(|c| ticker(c.interval));

    loop {
        tokio::select! {
            _ = liveness.tick() => {
                let alive = pool
                    .run(&service, tokio::time::timeout(call_timeout, adapter.is_alive(&handle)))
                    .await;
                match alive {
                    Ok(true) => {}
                    Ok(false) => {
                        let clean = adapter.exited_cleanly(&handle);
                        debug!(service = %service, epoch, ?clean, "service no longer alive");
                        let _ = reports.send(MonitorReport::Exited { service, epoch, clean });
                        return;
                    }
                    Err(_) => {
                        warn!(service = %service, "is_alive timed out; assuming alive");
                    }
                }
            }
            _ = next_probe(&mut probes) => {
                let Some(check) = check.as_ref() else { continue };
                let bound = check.timeout + call_timeout;
                let result = pool
                    .run(&service, tokio::time::timeout(bound, adapter.probe(&handle, check)))
                    .await
                    .unwrap_or_else(|_| {
                        ProbeResult::unhealthy(bound, format!("probe did not return within {bound:?}"))
                    });
                if reports
                    .send(MonitorReport::Probed { service: service.clone(), epoch, result })
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}
