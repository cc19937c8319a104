// src/manifest/loader.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::manifest::definition::Manifest;
use crate::manifest::model::RawManifest;
use crate::manifest::report::{MANIFEST_SCOPE, ValidationCheck, ValidationReport};
use crate::manifest::validate::{ValidationContext, validate};

/// Environment variable overriding [`default_manifest_path`].
pub const MANIFEST_ENV_VAR: &str = "LAUNCHVISOR_MANIFEST";

/// Read a manifest file and deserialize it without any semantic checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawManifest> {
    let contents = fs::read_to_string(path.as_ref())?;
    let raw: RawManifest = toml::from_str(&contents)?;
    Ok(raw)
}

/// Parse and validate manifest text in one go.
///
/// A TOML error is reported as a single [`ValidationCheck::Parse`] violation
/// so callers always deal with one report type.
pub fn load_from_str(text: &str, ctx: &ValidationContext) -> std::result::Result<Manifest, ValidationReport> {
    let raw: RawManifest = toml::from_str(text).map_err(|e| {
        let mut report = ValidationReport::new();
        report.push(MANIFEST_SCOPE, ValidationCheck::Parse, e.message().trim().to_string());
        report
    })?;
    validate(raw, ctx)
}

/// Load a manifest from `path` and validate it against `env`.
///
/// Relative compose files are resolved against the manifest's directory.
pub fn load_and_validate(path: impl AsRef<Path>, env: BTreeMap<String, String>) -> Result<Manifest> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;

    let mut ctx = ValidationContext::with_env(env);
    if let Some(parent) = path.parent() {
        let base = if parent.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            parent.to_path_buf()
        };
        ctx = ctx.base_dir(base);
    }

    let manifest = load_from_str(&text, &ctx)?;
    Ok(manifest)
}

/// `$LAUNCHVISOR_MANIFEST` if set, otherwise `Launchvisor.toml` in the
/// current directory.
pub fn default_manifest_path() -> PathBuf {
    std::env::var_os(MANIFEST_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("Launchvisor.toml"))
}

/// Snapshot of the current process environment, used as the resolved
/// environment when nothing else supplies one.
pub fn process_environment() -> BTreeMap<String, String> {
    std::env::vars().collect()
}
