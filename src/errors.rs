// src/errors.rs

//! Crate-wide error type and result alias.

use std::time::Duration;

use thiserror::Error;

use crate::manifest::ValidationReport;
use crate::types::ServiceId;

#[derive(Error, Debug)]
pub enum LaunchError {
    /// The manifest failed validation; nothing was started.
    #[error(transparent)]
    Manifest(#[from] ValidationReport),

    /// An adapter `start`/`stop`/`probe` call failed.
    #[error("adapter error for service '{service}': {message}")]
    Adapter { service: ServiceId, message: String },

    /// An adapter call or a start request exceeded its bound.
    #[error("service '{service}' timed out during {operation} after {elapsed:?}")]
    Timeout {
        service: ServiceId,
        operation: &'static str,
        elapsed: Duration,
    },

    /// A dependency never became ready within the overall start timeout.
    #[error("service '{service}' is still pending; dependencies not ready: {waiting_on:?}")]
    DependencyUnmet {
        service: ServiceId,
        waiting_on: Vec<ServiceId>,
    },

    /// The service reached `FAILED` (or was stopped) instead of becoming ready.
    #[error("service '{service}' failed: {reason}")]
    ServiceFailed { service: ServiceId, reason: String },

    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("service '{service}' is missing required environment variables: {missing:?}")]
    RequiredEnv {
        service: ServiceId,
        missing: Vec<String>,
    },

    #[error("supervisor control loop is no longer running")]
    SupervisorGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, LaunchError>;
