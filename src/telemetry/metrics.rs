// src/telemetry/metrics.rs

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::StateManager;
use crate::state::manager::serialize_millis;
use crate::types::ServiceId;

/// Per-service counters derived from the latest snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceMetrics {
    pub service: ServiceId,
    pub restart_count: u32,
    #[serde(rename = "uptime_ms", serialize_with = "serialize_millis")]
    pub uptime: Option<Duration>,
    #[serde(rename = "last_probe_latency_ms", serialize_with = "serialize_millis")]
    pub last_probe_latency: Option<Duration>,
}

/// Metrics for every known service at `now`.
pub fn collect(state: &StateManager, now: DateTime<Utc>) -> BTreeMap<ServiceId, ServiceMetrics> {
    state
        .all()
        .into_iter()
        .map(|snap| {
            let metrics = ServiceMetrics {
                service: snap.service.clone(),
                restart_count: snap.restart_count,
                uptime: snap.uptime(now),
                last_probe_latency: snap.last_probe_latency,
            };
            (snap.service, metrics)
        })
        .collect()
}
