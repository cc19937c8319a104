// src/state/instance.rs

//! Per-service runtime state owned by the supervisor core.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::ServiceId;

/// Lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Known but not (yet) dispatched, e.g. waiting on dependencies.
    Pending,
    /// Adapter `start` is in flight.
    Starting,
    /// Started; no healthy probe seen yet (or no health check declared).
    Running,
    Healthy,
    /// Failed a start, crashed, or crossed its probe failure threshold.
    Unhealthy,
    /// Backoff elapsed; the previous instance is being torn down.
    Restarting,
    Stopping,
    Stopped,
    /// Retry budget exhausted. Only an explicit `start` leaves this state.
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Pending => "PENDING",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Healthy => "HEALTHY",
            ServiceState::Unhealthy => "UNHEALTHY",
            ServiceState::Restarting => "RESTARTING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Stopped => "STOPPED",
            ServiceState::Failed => "FAILED",
        }
    }

    /// States in which the service's process is considered up.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            ServiceState::Running | ServiceState::Healthy | ServiceState::Unhealthy
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter call currently outstanding for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InFlight {
    Start,
    Stop,
}

/// Mutable runtime record for one service.
///
/// Public fields are the observable part; the rest is bookkeeping the
/// supervisor core needs to make decisions.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: ServiceId,
    pub state: ServiceState,
    /// A transitive dependency is `FAILED` or stopped unexpectedly.
    pub degraded: bool,
    /// Total number of retries fired over the instance's lifetime.
    pub restart_count: u32,
    pub last_health_change_at: Option<DateTime<Utc>>,
    pub last_probe_latency: Option<Duration>,
    pub last_error: Option<String>,
    /// Set on every transition into `RUNNING`; cleared when the process goes
    /// away.
    pub running_since: Option<DateTime<Utc>>,

    /// Operator intent: keep this service up.
    pub(crate) wanted: bool,
    /// Bumped on every start and stop dispatch; results and probes carrying
    /// an older epoch are ignored.
    pub(crate) epoch: u64,
    pub(crate) has_handle: bool,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) retry_pending: bool,
    /// Retries used since the last operator start; checked against
    /// `max_retries`.
    pub(crate) retries: u32,
    pub(crate) consecutive_probe_failures: u32,
    /// Last `STOPPED` was not requested by anyone.
    pub(crate) unexpected_stop: bool,
    /// Identifies the currently scheduled retry timer.
    pub(crate) retry_token: u64,
    pub(crate) correlation: Uuid,
}

impl ServiceInstance {
    pub fn new(id: impl Into<ServiceId>) -> Self {
        Self {
            id: id.into(),
            state: ServiceState::Pending,
            degraded: false,
            restart_count: 0,
            last_health_change_at: None,
            last_probe_latency: None,
            last_error: None,
            running_since: None,
            wanted: false,
            epoch: 0,
            has_handle: false,
            in_flight: None,
            retry_pending: false,
            retries: 0,
            consecutive_probe_failures: 0,
            unexpected_stop: false,
            retry_token: 0,
            correlation: Uuid::new_v4(),
        }
    }

    /// Counts as broken for the purpose of degrading dependents.
    pub fn is_broken(&self) -> bool {
        self.state == ServiceState::Failed
            || (self.state == ServiceState::Stopped && self.unexpected_stop)
    }

    /// No adapter call outstanding and nothing scheduled.
    pub fn is_settled(&self) -> bool {
        self.in_flight.is_none() && !self.retry_pending
    }
}
