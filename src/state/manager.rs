// src/state/manager.rs

//! Read-only, point-in-time view of every service.
//!
//! The supervisor is the only writer: it republishes snapshots after each
//! core step, right after the matching audit events were recorded. Readers
//! (the control handle, metrics, the HTTP status endpoint) never block the
//! control loop for longer than a map clone.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::state::instance::{ServiceInstance, ServiceState};
use crate::types::{ExecutionMode, ServiceId};

/// Public snapshot of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub service: ServiceId,
    pub mode: ExecutionMode,
    pub state: ServiceState,
    pub degraded: bool,
    pub restart_count: u32,
    pub last_health_change_at: Option<DateTime<Utc>>,
    #[serde(rename = "last_probe_latency_ms", serialize_with = "serialize_millis")]
    pub last_probe_latency: Option<Duration>,
    pub last_error: Option<String>,
    pub running_since: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn from_instance(instance: &ServiceInstance, mode: ExecutionMode) -> Self {
        Self {
            service: instance.id.clone(),
            mode,
            state: instance.state,
            degraded: instance.degraded,
            restart_count: instance.restart_count,
            last_health_change_at: instance.last_health_change_at,
            last_probe_latency: instance.last_probe_latency,
            last_error: instance.last_error.clone(),
            running_since: instance.running_since,
        }
    }

    /// Time since the last transition into `RUNNING`, while the service is
    /// still up.
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.state.is_up() {
            return None;
        }
        self.running_since
            .and_then(|since| (now - since).to_std().ok())
    }
}

pub(crate) fn serialize_millis<S>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(d) => s.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => s.serialize_none(),
    }
}

/// Shared, cloneable store of the latest snapshots.
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    inner: Arc<RwLock<BTreeMap<ServiceId, StateSnapshot>>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one service, if it exists.
    pub fn get(&self, service: &str) -> Option<StateSnapshot> {
        self.read().get(service).cloned()
    }

    /// Snapshots of every service, ordered by id.
    pub fn all(&self) -> Vec<StateSnapshot> {
        self.read().values().cloned().collect()
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.read().keys().cloned().collect()
    }

    /// Replace the whole view. Services missing from `snapshots` disappear.
    pub(crate) fn publish(&self, snapshots: impl IntoIterator<Item = StateSnapshot>) {
        let map = snapshots
            .into_iter()
            .map(|s| (s.service.clone(), s))
            .collect();
        match self.inner.write() {
            Ok(mut guard) => *guard = map,
            Err(poisoned) => *poisoned.into_inner() = map,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ServiceId, StateSnapshot>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
