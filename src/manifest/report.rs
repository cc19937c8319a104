// src/manifest/report.rs

//! Structured validation report: one entry per violation.

use std::fmt;

use serde::Serialize;

use crate::types::ServiceId;

/// Pseudo service id used for violations that concern the whole manifest.
pub const MANIFEST_SCOPE: &str = "<manifest>";

/// Validation stage that produced a violation, in the order stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationCheck {
    /// The document could not be parsed at all.
    Parse,
    /// Global `[supervisor]` / `[policy]` sanity.
    Settings,
    /// (a) duplicate, malformed or unknown service ids.
    Identity,
    /// (b) cycles in `depends_on`.
    Cycle,
    /// (c) execution-mode and health-check schema.
    Schema,
    /// (d) undeclared or colliding environment variables.
    Environment,
    /// (e) required variables missing from the resolved environment.
    RequiredEnv,
    /// (f) security-tag policy lint.
    SecurityPolicy,
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationCheck::Parse => "parse",
            ValidationCheck::Settings => "settings",
            ValidationCheck::Identity => "identity",
            ValidationCheck::Cycle => "cycle",
            ValidationCheck::Schema => "schema",
            ValidationCheck::Environment => "environment",
            ValidationCheck::RequiredEnv => "required-env",
            ValidationCheck::SecurityPolicy => "security-policy",
        };
        f.write_str(s)
    }
}

/// A single problem found in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub service: ServiceId,
    pub check: ValidationCheck,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.check, self.service, self.message)
    }
}

/// All violations found in one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, service: impl Into<ServiceId>, check: ValidationCheck, message: impl Into<String>) {
        self.violations.push(Violation {
            service: service.into(),
            check,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter()
    }

    /// Violations produced by a given stage.
    pub fn by_check(&self, check: ValidationCheck) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.check == check)
    }

    /// Violations attributed to a given service.
    pub fn for_service<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a Violation> {
        self.violations.iter().filter(move |v| v.service == service)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "manifest validation failed with {} violation(s)",
            self.violations.len()
        )?;
        for v in &self.violations {
            write!(f, "\n  - {v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}
