// src/telemetry/mod.rs

//! Observability: the audit log, per-service metrics and the read-only
//! status endpoint.

pub mod audit;
pub mod http;
pub mod metrics;

pub use audit::{AuditEvent, AuditLog, EventTail};
pub use metrics::ServiceMetrics;
