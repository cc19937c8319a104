// tests/manifest_validation.rs

mod common;
use crate::common::builders::{ManifestBuilder, ServiceBuilder};
use crate::common::{env_of, init_tracing};

use std::error::Error;
use std::fs;
use std::time::Duration;

use launchvisor::errors::LaunchError;
use launchvisor::manifest::{
    Execution, MANIFEST_SCOPE, ProbeTarget, ValidationCheck, ValidationContext, load_and_validate,
    load_from_str, validate,
};
use launchvisor::types::{CascadeMode, ExecutionMode, RestartPolicyKind};

type TestResult = Result<(), Box<dyn Error>>;

const VALID: &str = r#"
[supervisor]
workers = 2
start_timeout = "20s"
cascade = "degrade"

[environment]
declare = ["DATABASE_URL", "HOME"]

[[service]]
id = "db"
mode = "command"
command = "postgres"
args = ["-D", "/var/lib/pg"]
health = { kind = "tcp", address = "127.0.0.1:5432", interval = "1s", failure_threshold = 2 }

[[service]]
id = "api"
mode = "protocol-server"
command = "./api"
ready_on_stdout = "listening on"
depends_on = ["db"]
env_allowlist = ["HOME"]
required_env = ["DATABASE_URL"]
env = { RUST_LOG = "info" }
restart = { policy = "always", backoff_base = "100ms", backoff_cap = "2s", max_retries = "unbounded" }
"#;

#[test]
fn valid_manifest_is_assembled() -> TestResult {
    init_tracing();

    let ctx = ValidationContext::with_env(env_of(&[("DATABASE_URL", "postgres://x")]));
    let manifest = load_from_str(VALID, &ctx)?;

    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest.ids().collect::<Vec<_>>(), vec!["db", "api"]);

    let settings = manifest.settings();
    assert_eq!(settings.workers, 2);
    assert_eq!(settings.start_timeout, Duration::from_secs(20));
    assert_eq!(settings.cascade, CascadeMode::Degrade);

    let db = manifest.service("db").ok_or("db missing")?;
    assert_eq!(db.mode(), ExecutionMode::Command);
    let health = db.health.as_ref().ok_or("db health missing")?;
    assert_eq!(health.target, ProbeTarget::Tcp("127.0.0.1:5432".to_string()));
    assert_eq!(health.failure_threshold, 2);

    let api = manifest.service("api").ok_or("api missing")?;
    assert_eq!(api.mode(), ExecutionMode::ProtocolServer);
    assert!(matches!(&api.execution, Execution::ProtocolServer(s) if s.ready_on_stdout.as_deref() == Some("listening on")));
    assert_eq!(api.restart.kind, RestartPolicyKind::Always);
    assert!(api.depends_on.contains("db"));
    Ok(())
}

#[test]
fn propagated_env_contains_only_allowlisted_and_declared_values() -> TestResult {
    let ctx = ValidationContext::with_env(env_of(&[("DATABASE_URL", "postgres://x")]));
    let manifest = load_from_str(VALID, &ctx)?;
    let api = manifest.service("api").ok_or("api missing")?;

    let resolved = env_of(&[
        ("HOME", "/home/svc"),
        ("DATABASE_URL", "postgres://x"),
        ("SECRET_TOKEN", "do-not-leak"),
    ]);
    let env = api.propagated_env(&resolved);

    assert_eq!(env.get("HOME").map(String::as_str), Some("/home/svc"));
    assert_eq!(env.get("RUST_LOG").map(String::as_str), Some("info"));
    assert!(!env.contains_key("SECRET_TOKEN"));
    Ok(())
}

#[test]
fn cycle_report_names_every_member() {
    init_tracing();

    let raw = ManifestBuilder::new()
        .service(ServiceBuilder::command("a", "true").depends_on("c"))
        .service(ServiceBuilder::command("b", "true").depends_on("a"))
        .service(ServiceBuilder::command("c", "true").depends_on("b"))
        .service(ServiceBuilder::command("d", "true").depends_on("a"))
        .raw();

    let report = validate(raw, &ValidationContext::default()).expect_err("cycle must be rejected");
    let cycles: Vec<_> = report.by_check(ValidationCheck::Cycle).collect();

    assert_eq!(cycles.len(), 1);
    for member in ["a", "b", "c"] {
        assert!(
            cycles[0].message.contains(member),
            "cycle message should name '{member}': {}",
            cycles[0].message
        );
    }
    assert!(!cycles[0].message.contains("<-> d"));
    assert!(!cycles[0].message.contains(": d"));
}

#[test]
fn identity_violations_are_reported_per_service() {
    let raw = ManifestBuilder::new()
        .service(ServiceBuilder::command("web", "true"))
        .service(ServiceBuilder::command("web", "true"))
        .service(ServiceBuilder::command("worker", "true").depends_on("queue"))
        .service(ServiceBuilder::command("loop", "true").depends_on("loop"))
        .service(ServiceBuilder::command("bad id", "true"))
        .raw();

    let report = validate(raw, &ValidationContext::default()).expect_err("must be rejected");
    let identity: Vec<_> = report.by_check(ValidationCheck::Identity).collect();

    assert_eq!(identity.iter().filter(|v| v.service == "web").count(), 1);
    assert!(identity.iter().any(|v| v.service == "worker" && v.message.contains("queue")));
    assert!(identity.iter().any(|v| v.service == "loop" && v.message.contains("itself")));
    assert!(identity.iter().any(|v| v.service == "bad id"));
}

#[test]
fn schema_checks_are_mode_specific() {
    let raw = ManifestBuilder::new()
        .service(ServiceBuilder::new("no-exe", ExecutionMode::Command))
        .service(ServiceBuilder::new("no-stack", ExecutionMode::Compose))
        .service(ServiceBuilder::protocol_server("bad-regex", "srv").ready_on_stdout("(unclosed"))
        .service(ServiceBuilder::command("bad-restart", "true").jitter(1.5))
        .raw();

    let report = validate(raw, &ValidationContext::default()).expect_err("must be rejected");
    let schema: Vec<_> = report.by_check(ValidationCheck::Schema).collect();

    for service in ["no-exe", "no-stack", "bad-regex", "bad-restart"] {
        assert!(
            schema.iter().any(|v| v.service == service),
            "expected a schema violation for {service}: {report}"
        );
    }
}

#[test]
fn compose_file_must_exist_relative_to_manifest() -> TestResult {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("stack.yml"), "services: {}\n")?;

    let ok = ManifestBuilder::new()
        .service(ServiceBuilder::compose("stack", "stack.yml"))
        .raw();
    let manifest = validate(ok, &ValidationContext::default().base_dir(dir.path()))?;
    match &manifest.service("stack").ok_or("stack missing")?.execution {
        Execution::Compose(stack) => {
            assert_eq!(stack.file, dir.path().join("stack.yml"));
            assert_eq!(stack.project, "stack");
        }
        other => return Err(format!("unexpected execution {other:?}").into()),
    }

    let missing = ManifestBuilder::new()
        .service(ServiceBuilder::compose("stack", "missing.yml"))
        .raw();
    let report = validate(missing, &ValidationContext::default().base_dir(dir.path()))
        .expect_err("missing compose file must be rejected");
    assert!(report.by_check(ValidationCheck::Schema).any(|v| v.message.contains("missing.yml")));
    Ok(())
}

#[test]
fn environment_collisions_and_required_env_are_rejected() {
    let raw = ManifestBuilder::new()
        .declare_env("HOME")
        .declare_env("API_KEY")
        .service(
            ServiceBuilder::command("api", "true")
                .env_allowlist("HOME")
                .env("HOME", "/override")
                .required_env("API_KEY"),
        )
        .service(ServiceBuilder::command("undeclared", "true").env_allowlist("SHELL"))
        .raw();

    let report = validate(raw, &ValidationContext::default()).expect_err("must be rejected");

    assert!(report
        .for_service("api")
        .any(|v| v.check == ValidationCheck::Environment && v.message.contains("HOME")));
    assert!(report
        .for_service("api")
        .any(|v| v.check == ValidationCheck::RequiredEnv && v.message.contains("API_KEY")));
    assert!(report
        .for_service("undeclared")
        .any(|v| v.check == ValidationCheck::Environment && v.message.contains("SHELL")));
}

#[test]
fn required_env_present_in_context_passes() -> TestResult {
    let raw = ManifestBuilder::new()
        .declare_env("API_KEY")
        .service(ServiceBuilder::command("api", "true").required_env("API_KEY"))
        .raw();

    let manifest = validate(raw, &ValidationContext::with_env(env_of(&[("API_KEY", "k")])))?;
    assert!(manifest.contains("api"));
    Ok(())
}

#[test]
fn security_tag_policy_is_linted() {
    let raw = ManifestBuilder::new()
        .require_security_tags()
        .allow_security_tag("internal")
        .service(ServiceBuilder::command("untagged", "true"))
        .service(ServiceBuilder::command("wrong-tag", "true").security_tag("public"))
        .service(ServiceBuilder::command("fine", "true").security_tag("internal"))
        .raw();

    let report = validate(raw, &ValidationContext::default()).expect_err("must be rejected");
    let lint: Vec<_> = report.by_check(ValidationCheck::SecurityPolicy).collect();

    assert_eq!(lint.len(), 2);
    assert!(lint.iter().any(|v| v.service == "untagged"));
    assert!(lint.iter().any(|v| v.service == "wrong-tag" && v.message.contains("public")));
}

#[test]
fn cascade_mode_must_be_explicit() {
    let raw = ManifestBuilder::new()
        .no_cascade()
        .service(ServiceBuilder::command("a", "true"))
        .raw();

    let report = validate(raw, &ValidationContext::default()).expect_err("must be rejected");
    assert!(report
        .by_check(ValidationCheck::Settings)
        .any(|v| v.service == MANIFEST_SCOPE && v.message.contains("cascade")));
}

#[test]
fn every_violation_is_reported_not_just_the_first() {
    let raw = ManifestBuilder::new()
        .workers(0)
        .service(ServiceBuilder::new("a", ExecutionMode::Command).depends_on("ghost"))
        .service(ServiceBuilder::command("b", "true").max_retries(1).jitter(-0.5))
        .raw();

    let report = validate(raw, &ValidationContext::default()).expect_err("must be rejected");

    assert!(report.len() >= 4, "expected one entry per violation: {report}");
    assert!(report.by_check(ValidationCheck::Settings).count() >= 1);
    assert!(report.for_service("a").count() >= 2);
    assert!(report.for_service("b").count() >= 1);
}

#[test]
fn toml_errors_become_parse_violations() {
    let report = load_from_str("[[service]\nid = ", &ValidationContext::default())
        .expect_err("broken TOML must be rejected");

    assert_eq!(report.len(), 1);
    assert_eq!(report.violations()[0].check, ValidationCheck::Parse);
    assert_eq!(report.violations()[0].service, MANIFEST_SCOPE);
}

#[test]
fn oversized_durations_are_reported_not_panicked_on() {
    let text = r#"
[supervisor]
start_timeout = "999999999999999999h"
cascade = "stop"

[[service]]
id = "svc"
mode = "command"
command = "svc"
"#;
    let report = load_from_str(text, &ValidationContext::default())
        .expect_err("overflowing duration must be rejected");

    assert_eq!(report.len(), 1);
    assert_eq!(report.violations()[0].check, ValidationCheck::Parse);
    assert!(report.violations()[0].message.contains("too large"), "{report}");
}

#[test]
fn load_and_validate_reads_from_disk() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Launchvisor.toml");
    fs::write(&path, VALID)?;

    let manifest = load_and_validate(&path, env_of(&[("DATABASE_URL", "postgres://x")]))?;
    assert_eq!(manifest.len(), 2);

    let err = load_and_validate(&path, env_of(&[])).expect_err("DATABASE_URL is required");
    match err {
        LaunchError::Manifest(report) => {
            assert!(report.by_check(ValidationCheck::RequiredEnv).any(|v| v.service == "api"));
        }
        other => return Err(format!("unexpected error {other}").into()),
    }
    Ok(())
}
