// src/manifest/mod.rs

//! Manifest loading and validation.
//!
//! - [`model`] is the raw TOML shape.
//! - [`validate`] runs every check and collects a [`ValidationReport`].
//! - [`definition`] holds the immutable, validated [`Manifest`].

pub mod definition;
pub mod duration;
pub mod loader;
pub mod model;
pub mod report;
pub mod restart;
pub mod validate;

pub use definition::{
    ComposeStack, Execution, HealthCheck, Manifest, ProbeTarget, ProcessSpec, ProtocolServerSpec,
    ServiceDefinition, SupervisorSettings,
};
pub use loader::{default_manifest_path, load_and_validate, load_from_path, load_from_str};
pub use model::RawManifest;
pub use report::{MANIFEST_SCOPE, ValidationCheck, ValidationReport, Violation};
pub use restart::{Backoff, MaxRetries, RestartPolicy};
pub use validate::{ValidationContext, validate};
