// src/manifest/validate.rs

//! Manifest validation.
//!
//! Checks run in a fixed order and every violation is collected, so one pass
//! reports everything that is wrong with a manifest:
//!
//! 1. global settings sanity,
//! 2. service ids: empty, malformed, duplicate, unknown or self deps,
//! 3. dependency cycles,
//! 4. execution-mode and health-check schema,
//! 5. environment declarations and allowlist/declared collisions,
//! 6. required variables present in the resolved environment,
//! 7. security-tag policy lint.
//!
//! Validation never touches a process.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;

use crate::manifest::definition::{
    ComposeStack, Execution, HealthCheck, Manifest, ProbeTarget, ProcessSpec, ProtocolServerSpec,
    ServiceDefinition, SupervisorSettings,
};
use crate::manifest::model::{HealthConfig, RawManifest, ServiceConfig};
use crate::manifest::report::{MANIFEST_SCOPE, ValidationCheck, ValidationReport};
use crate::manifest::restart::{Backoff, RestartPolicy};
use crate::types::{ExecutionMode, HealthCheckKind};

/// Inputs validation needs besides the manifest itself.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Resolved environment supplied by the configuration layer.
    pub env: BTreeMap<String, String>,
    /// Directory relative compose files are resolved against. When set,
    /// compose files must also exist.
    pub base_dir: Option<PathBuf>,
}

impl ValidationContext {
    pub fn with_env(env: BTreeMap<String, String>) -> Self {
        Self { env, base_dir: None }
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }
}

impl TryFrom<RawManifest> for Manifest {
    type Error = ValidationReport;

    /// Validate against an empty environment with no base directory.
    fn try_from(raw: RawManifest) -> Result<Self, Self::Error> {
        validate(raw, &ValidationContext::default())
    }
}

/// Validate a raw manifest and, if it is clean, assemble the typed
/// [`Manifest`].
pub fn validate(raw: RawManifest, ctx: &ValidationContext) -> Result<Manifest, ValidationReport> {
    let mut report = ValidationReport::new();

    let settings = check_settings(&raw, &mut report);
    check_identity(&raw, &mut report);
    check_cycles(&raw, &mut report);
    let executions = check_schema(&raw, ctx, &mut report);
    check_environment(&raw, &mut report);
    check_required_env(&raw, ctx, &mut report);
    check_security_policy(&raw, &mut report);

    match settings {
        Some(settings) if report.is_empty() => Ok(assemble(raw, settings, executions)),
        _ => Err(report),
    }
}

/// Report-only variant: always returns the (possibly empty) report.
pub fn validate_report(raw: RawManifest, ctx: &ValidationContext) -> ValidationReport {
    match validate(raw, ctx) {
        Ok(_) => ValidationReport::new(),
        Err(report) => report,
    }
}

fn check_settings(raw: &RawManifest, report: &mut ValidationReport) -> Option<SupervisorSettings> {
    let s = &raw.supervisor;

    if s.workers == 0 {
        report.push(
            MANIFEST_SCOPE,
            ValidationCheck::Settings,
            "[supervisor].workers must be >= 1 (got 0)",
        );
    }
    if s.start_timeout.is_zero() {
        report.push(
            MANIFEST_SCOPE,
            ValidationCheck::Settings,
            "[supervisor].start_timeout must be greater than zero",
        );
    }
    if s.call_timeout.is_zero() {
        report.push(
            MANIFEST_SCOPE,
            ValidationCheck::Settings,
            "[supervisor].call_timeout must be greater than zero",
        );
    }
    if s.liveness_interval.is_zero() {
        report.push(
            MANIFEST_SCOPE,
            ValidationCheck::Settings,
            "[supervisor].liveness_interval must be greater than zero",
        );
    }

    let Some(cascade) = s.cascade else {
        report.push(
            MANIFEST_SCOPE,
            ValidationCheck::Settings,
            "[supervisor].cascade must be set explicitly to \"stop\" or \"degrade\"",
        );
        return None;
    };

    Some(SupervisorSettings {
        workers: s.workers,
        start_timeout: s.start_timeout,
        call_timeout: s.call_timeout,
        stop_grace_period: s.stop_grace_period,
        cascade,
        retry_ceiling: s.retry_ceiling,
        liveness_interval: s.liveness_interval,
    })
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn check_identity(raw: &RawManifest, report: &mut ValidationReport) {
    if raw.service.is_empty() {
        report.push(
            MANIFEST_SCOPE,
            ValidationCheck::Identity,
            "manifest must declare at least one [[service]]",
        );
        return;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for svc in &raw.service {
        *seen.entry(svc.id.as_str()).or_insert(0) += 1;
    }

    let mut reported_duplicates = BTreeSet::new();
    for (index, svc) in raw.service.iter().enumerate() {
        if svc.id.trim().is_empty() {
            report.push(
                format!("service[{index}]"),
                ValidationCheck::Identity,
                "service id must not be empty",
            );
            continue;
        }
        if !is_valid_id(&svc.id) {
            report.push(
                svc.id.clone(),
                ValidationCheck::Identity,
                "service id may only contain ASCII letters, digits, '-', '_' and '.'",
            );
        }
        if seen.get(svc.id.as_str()).copied().unwrap_or(0) > 1
            && reported_duplicates.insert(svc.id.as_str())
        {
            report.push(
                svc.id.clone(),
                ValidationCheck::Identity,
                format!(
                    "service id '{}' is declared {} times",
                    svc.id,
                    seen[svc.id.as_str()]
                ),
            );
        }

        for dep in &svc.depends_on {
            if dep == &svc.id {
                report.push(
                    svc.id.clone(),
                    ValidationCheck::Identity,
                    format!("service '{}' cannot depend on itself", svc.id),
                );
            } else if !seen.contains_key(dep.as_str()) {
                report.push(
                    svc.id.clone(),
                    ValidationCheck::Identity,
                    format!("service '{}' depends on unknown service '{}'", svc.id, dep),
                );
            }
        }
    }
}

fn check_cycles(raw: &RawManifest, report: &mut ValidationReport) {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for svc in &raw.service {
        graph.add_node(svc.id.as_str());
    }
    for svc in &raw.service {
        for dep in &svc.depends_on {
            if dep != &svc.id && graph.contains_node(dep.as_str()) {
                graph.add_edge(dep.as_str(), svc.id.as_str(), ());
            }
        }
    }

    let mut cycles: Vec<Vec<&str>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|mut component| {
            component.sort_unstable();
            component
        })
        .collect();
    cycles.sort();

    for members in cycles {
        report.push(
            members[0].to_string(),
            ValidationCheck::Cycle,
            format!(
                "services form a dependency cycle: {}",
                members.join(" <-> ")
            ),
        );
    }
}

/// Per-service schema checks. Returns the typed execution and health check
/// of every service that passed them.
fn check_schema(
    raw: &RawManifest,
    ctx: &ValidationContext,
    report: &mut ValidationReport,
) -> BTreeMap<String, (Execution, Option<HealthCheck>)> {
    let mut typed = BTreeMap::new();

    for svc in &raw.service {
        let before = report.len();

        let execution = match svc.mode {
            ExecutionMode::Compose => check_compose(svc, ctx, report).map(Execution::Compose),
            ExecutionMode::Command => check_process(svc, report).map(Execution::Command),
            ExecutionMode::ProtocolServer => {
                check_protocol_server(svc, report).map(Execution::ProtocolServer)
            }
        };

        let health = match &svc.health {
            Some(h) => check_health(&svc.id, h, report).map(Some),
            None => Some(None),
        };

        check_restart(svc, report);

        if let (Some(execution), Some(health)) = (execution, health) {
            if report.len() == before {
                typed.insert(svc.id.clone(), (execution, health));
            }
        }
    }

    typed
}

fn check_compose(
    svc: &ServiceConfig,
    ctx: &ValidationContext,
    report: &mut ValidationReport,
) -> Option<ComposeStack> {
    let Some(compose) = &svc.compose else {
        report.push(
            svc.id.clone(),
            ValidationCheck::Schema,
            "compose service must declare `compose = { file = \"...\" }`",
        );
        return None;
    };

    let Some(file) = compose.file.as_ref().filter(|f| !f.as_os_str().is_empty()) else {
        report.push(
            svc.id.clone(),
            ValidationCheck::Schema,
            "compose service must reference a stack file (`compose.file`)",
        );
        return None;
    };

    let resolved = resolve_path(ctx.base_dir.as_deref(), file);
    if ctx.base_dir.is_some() && !resolved.is_file() {
        report.push(
            svc.id.clone(),
            ValidationCheck::Schema,
            format!("compose file '{}' does not exist", resolved.display()),
        );
        return None;
    }

    Some(ComposeStack {
        file: resolved,
        project: compose.project.clone().unwrap_or_else(|| svc.id.clone()),
        services: compose.services.clone(),
    })
}

fn resolve_path(base: Option<&Path>, path: &Path) -> PathBuf {
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

fn check_process(svc: &ServiceConfig, report: &mut ValidationReport) -> Option<ProcessSpec> {
    match svc.command.as_deref().map(str::trim) {
        Some(program) if !program.is_empty() => Some(ProcessSpec {
            program: program.to_string(),
            args: svc.args.clone(),
            working_dir: svc.working_dir.clone(),
        }),
        _ => {
            report.push(
                svc.id.clone(),
                ValidationCheck::Schema,
                format!("{} service must specify an executable in `command`", svc.mode),
            );
            None
        }
    }
}

fn check_protocol_server(
    svc: &ServiceConfig,
    report: &mut ValidationReport,
) -> Option<ProtocolServerSpec> {
    let process = check_process(svc, report);
    let mut ok = process.is_some();

    if let Some(pattern) = &svc.ready_on_stdout {
        if let Err(e) = Regex::new(pattern) {
            report.push(
                svc.id.clone(),
                ValidationCheck::Schema,
                format!("`ready_on_stdout` is not a valid regex: {e}"),
            );
            ok = false;
        }
    }

    if let Some(listen) = &svc.listen {
        if !is_host_port(listen) {
            report.push(
                svc.id.clone(),
                ValidationCheck::Schema,
                format!("`listen` must be host:port, got '{listen}'"),
            );
            ok = false;
        }
    }

    if !ok {
        return None;
    }
    process.map(|process| ProtocolServerSpec {
        process,
        ready_on_stdout: svc.ready_on_stdout.clone(),
        listen: svc.listen.clone(),
    })
}

fn is_host_port(s: &str) -> bool {
    if s.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn check_health(id: &str, h: &HealthConfig, report: &mut ValidationReport) -> Option<HealthCheck> {
    let before = report.len();

    let target = match h.kind {
        HealthCheckKind::Command => match h.command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => Some(ProbeTarget::Command(cmd.to_string())),
            _ => {
                report.push(
                    id,
                    ValidationCheck::Schema,
                    "command health check requires `health.command`",
                );
                None
            }
        },
        HealthCheckKind::Tcp => match h.address.as_deref() {
            Some(addr) if is_host_port(addr) => Some(ProbeTarget::Tcp(addr.to_string())),
            _ => {
                report.push(
                    id,
                    ValidationCheck::Schema,
                    "tcp health check requires `health.address` as host:port",
                );
                None
            }
        },
        HealthCheckKind::Http => match h.url.as_deref() {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Some(ProbeTarget::Http(url.to_string()))
            }
            _ => {
                report.push(
                    id,
                    ValidationCheck::Schema,
                    "http health check requires an http(s) `health.url`",
                );
                None
            }
        },
    };

    if h.interval.is_zero() {
        report.push(id, ValidationCheck::Schema, "`health.interval` must be greater than zero");
    }
    if h.timeout.is_zero() {
        report.push(id, ValidationCheck::Schema, "`health.timeout` must be greater than zero");
    }
    if h.failure_threshold == 0 {
        report.push(
            id,
            ValidationCheck::Schema,
            "`health.failure_threshold` must be >= 1",
        );
    }

    if report.len() != before {
        return None;
    }
    target.map(|target| HealthCheck {
        target,
        interval: h.interval,
        timeout: h.timeout,
        failure_threshold: h.failure_threshold,
    })
}

fn check_restart(svc: &ServiceConfig, report: &mut ValidationReport) {
    let r = &svc.restart;
    if !r.jitter.is_finite() || !(0.0..=1.0).contains(&r.jitter) {
        report.push(
            svc.id.clone(),
            ValidationCheck::Schema,
            format!("`restart.jitter` must be within [0, 1], got {}", r.jitter),
        );
    }
    if r.backoff_base > r.backoff_cap {
        report.push(
            svc.id.clone(),
            ValidationCheck::Schema,
            format!(
                "`restart.backoff_base` ({:?}) exceeds `restart.backoff_cap` ({:?})",
                r.backoff_base, r.backoff_cap
            ),
        );
    }
}

fn check_environment(raw: &RawManifest, report: &mut ValidationReport) {
    let declared: BTreeSet<&str> = raw.environment.declare.iter().map(|s| s.as_str()).collect();

    for svc in &raw.service {
        for key in &svc.env_allowlist {
            if !declared.contains(key.as_str()) {
                report.push(
                    svc.id.clone(),
                    ValidationCheck::Environment,
                    format!("`env_allowlist` references undeclared variable '{key}'"),
                );
            }
            if svc.env.contains_key(key) {
                report.push(
                    svc.id.clone(),
                    ValidationCheck::Environment,
                    format!(
                        "variable '{key}' is both inherited via `env_allowlist` and declared in `env`"
                    ),
                );
            }
        }
        for key in &svc.required_env {
            if !declared.contains(key.as_str()) {
                report.push(
                    svc.id.clone(),
                    ValidationCheck::Environment,
                    format!("`required_env` references undeclared variable '{key}'"),
                );
            }
        }
    }
}

fn check_required_env(raw: &RawManifest, ctx: &ValidationContext, report: &mut ValidationReport) {
    for svc in &raw.service {
        for key in &svc.required_env {
            if !ctx.env.contains_key(key) {
                report.push(
                    svc.id.clone(),
                    ValidationCheck::RequiredEnv,
                    format!("required variable '{key}' is not set in the resolved environment"),
                );
            }
        }
    }
}

fn check_security_policy(raw: &RawManifest, report: &mut ValidationReport) {
    let policy = &raw.policy;
    let allowed: BTreeSet<&str> = policy
        .allowed_security_tags
        .iter()
        .map(|s| s.as_str())
        .collect();

    for svc in &raw.service {
        if policy.require_security_tags && svc.security_tags.is_empty() {
            report.push(
                svc.id.clone(),
                ValidationCheck::SecurityPolicy,
                "policy requires at least one entry in `security_tags`",
            );
        }
        if !allowed.is_empty() {
            for tag in &svc.security_tags {
                if !allowed.contains(tag.as_str()) {
                    report.push(
                        svc.id.clone(),
                        ValidationCheck::SecurityPolicy,
                        format!("security tag '{tag}' is not in `[policy].allowed_security_tags`"),
                    );
                }
            }
        }
    }
}

fn assemble(
    raw: RawManifest,
    settings: SupervisorSettings,
    mut executions: BTreeMap<String, (Execution, Option<HealthCheck>)>,
) -> Manifest {
    let declared_env = raw.environment.declare.into_iter().collect();

    let definitions = raw
        .service
        .into_iter()
        .filter_map(|svc| {
            let (execution, health) = executions.remove(&svc.id)?;
            Some(ServiceDefinition {
                execution,
                health,
                depends_on: svc.depends_on.into_iter().collect(),
                restart: RestartPolicy {
                    kind: svc.restart.policy,
                    backoff: Backoff {
                        base: svc.restart.backoff_base,
                        cap: svc.restart.backoff_cap,
                        jitter: svc.restart.jitter,
                    },
                    max_retries: svc.restart.max_retries,
                },
                env_allowlist: svc.env_allowlist.into_iter().collect(),
                required_env: svc.required_env.into_iter().collect(),
                env: svc.env,
                security_tags: svc.security_tags.into_iter().collect(),
                id: svc.id,
            })
        })
        .collect();

    Manifest::new_unchecked(settings, declared_env, definitions)
}
