// src/telemetry/audit.rs

//! Append-only audit log of state transitions.
//!
//! A single mutex serialises writers; every recorded event is also mirrored
//! to `tracing` and fanned out on a broadcast channel for live tails.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::ServiceState;
use crate::types::ServiceId;

const LIVE_CAPACITY: usize = 1024;

/// One recorded transition. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Position in the log, starting at 0.
    pub sequence: u64,
    pub service: ServiceId,
    pub from: ServiceState,
    pub to: ServiceState,
    /// Degraded flag after the transition. `from == to` events record a
    /// change of this flag alone.
    pub degraded: bool,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub detail: String,
}

#[derive(Debug)]
struct Inner {
    events: Mutex<Vec<AuditEvent>>,
    live: broadcast::Sender<AuditEvent>,
}

/// Cloneable handle to the shared log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    inner: Arc<Inner>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(Vec::new()),
                live,
            }),
        }
    }

    /// Append a transition and return the stored event.
    pub fn record(
        &self,
        service: &str,
        from: ServiceState,
        to: ServiceState,
        degraded: bool,
        correlation_id: Uuid,
        detail: impl Into<String>,
    ) -> AuditEvent {
        let detail = detail.into();
        let mut events = self.lock();

        let event = AuditEvent {
            sequence: events.len() as u64,
            service: service.to_string(),
            from,
            to,
            degraded,
            timestamp: Utc::now(),
            correlation_id,
            detail,
        };

        info!(
            service = %event.service,
            from = %event.from,
            to = %event.to,
            degraded = event.degraded,
            correlation_id = %event.correlation_id,
            detail = %event.detail,
            "service transition"
        );

        events.push(event.clone());
        // No subscribers is fine.
        let _ = self.inner.live.send(event.clone());
        event
    }

    /// Recorded events, optionally restricted to one service.
    pub fn events(&self, service: Option<&str>) -> Vec<AuditEvent> {
        self.lock()
            .iter()
            .filter(|e| service.is_none_or(|s| e.service == s))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Backlog matching the filter followed by live events.
    ///
    /// Subscribing happens under the writer lock, so no event is delivered
    /// twice or lost between backlog and live stream.
    pub fn tail(&self, service: Option<ServiceId>, since: Option<DateTime<Utc>>) -> EventTail {
        let events = self.lock();
        let filter = TailFilter { service, since };
        let backlog = events.iter().filter(|e| filter.matches(e)).cloned().collect();
        let live = self.inner.live.subscribe();
        drop(events);

        EventTail {
            backlog,
            live,
            filter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditEvent>> {
        match self.inner.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
struct TailFilter {
    service: Option<ServiceId>,
    since: Option<DateTime<Utc>>,
}

impl TailFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.service.as_ref().is_none_or(|s| &event.service == s)
            && self.since.is_none_or(|t| event.timestamp >= t)
    }
}

/// Stream of audit events returned by [`AuditLog::tail`].
#[derive(Debug)]
pub struct EventTail {
    backlog: VecDeque<AuditEvent>,
    live: broadcast::Receiver<AuditEvent>,
    filter: TailFilter,
}

impl EventTail {
    /// Next matching event; waits for live events once the backlog is
    /// drained. `None` once the log is gone.
    pub async fn next(&mut self) -> Option<AuditEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "audit tail lagged behind; events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`EventTail::next`].
    pub fn try_next(&mut self) -> Option<AuditEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "audit tail lagged behind; events were dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
