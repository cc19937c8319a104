// src/health/mod.rs

//! Periodic liveness polling and health probing.

pub mod monitor;

pub use monitor::{HealthMonitor, MonitorReport, Watch};
