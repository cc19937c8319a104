// tests/supervisor_restart.rs

mod common;
use crate::common::builders::{ManifestBuilder, ServiceBuilder};
use crate::common::fake_adapter::FakeAdapter;
use crate::common::{init_tracing, state_path, wait_for_state, wait_until, with_timeout};

use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;

use launchvisor::errors::LaunchError;
use launchvisor::manifest::Manifest;
use launchvisor::state::ServiceState::*;
use launchvisor::supervisor::{Selection, Supervisor, SupervisorHandle};
use launchvisor::types::RestartPolicyKind;

type TestResult = Result<(), Box<dyn Error>>;

fn spawn(manifest: Manifest, fake: &FakeAdapter) -> SupervisorHandle {
    Supervisor::spawn(manifest, BTreeMap::new(), fake.registry())
}

fn restart_count(sup: &SupervisorHandle, id: &str) -> u32 {
    sup.state().get(id).map(|s| s.restart_count).unwrap_or_default()
}

#[tokio::test]
async fn never_policy_fails_without_retrying() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    fake.fail_all_starts("once", "binary not found");
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("once", "once").restart(RestartPolicyKind::Never))
        .build();
    let sup = spawn(manifest, &fake);

    let results = with_timeout(sup.start(Selection::All)).await?;

    match &results["once"] {
        Err(LaunchError::ServiceFailed { reason, .. }) => {
            assert!(reason.contains("binary not found"), "{reason}");
        }
        other => return Err(format!("unexpected result {other:?}").into()),
    }
    assert_eq!(fake.start_calls("once"), 1);
    assert_eq!(restart_count(&sup, "once"), 0);
    assert_eq!(state_path(sup.audit(), "once"), vec![Pending, Starting, Failed]);
    Ok(())
}

#[tokio::test]
async fn on_failure_gives_up_after_max_retries() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    fake.fail_all_starts("flaky", "connection refused");
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("flaky", "flaky").max_retries(2))
        .build();
    let sup = spawn(manifest, &fake);

    let results = with_timeout(sup.start(Selection::All)).await?;

    assert!(matches!(results["flaky"], Err(LaunchError::ServiceFailed { .. })));
    // max_retries = 2 means the initial attempt plus two retries.
    assert_eq!(fake.start_calls("flaky"), 3);
    assert_eq!(restart_count(&sup, "flaky"), 2);
    assert_eq!(sup.state().get("flaky").map(|s| s.state), Some(Failed));

    let last_error = sup
        .state()
        .get("flaky")
        .and_then(|s| s.last_error)
        .unwrap_or_default();
    assert!(last_error.contains("retry budget exhausted"), "{last_error}");
    Ok(())
}

#[tokio::test]
async fn dependent_recovers_from_one_failed_start() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    fake.fail_next_starts("b", 1);
    let manifest = ManifestBuilder::new()
        .service(
            ServiceBuilder::command("a", "a")
                .restart(RestartPolicyKind::Always)
                .probed(2),
        )
        .service(
            ServiceBuilder::command("b", "b")
                .depends_on("a")
                .restart(RestartPolicyKind::OnFailure)
                .max_retries(1)
                .probed(1),
        )
        .build();
    let sup = spawn(manifest, &fake);

    let results = with_timeout(sup.start(Selection::All)).await?;
    assert!(matches!(results["a"], Ok(Healthy)));
    assert!(matches!(results["b"], Ok(Healthy)));

    assert_eq!(
        state_path(sup.audit(), "b"),
        vec![Pending, Starting, Unhealthy, Restarting, Starting, Running, Healthy]
    );
    assert_eq!(restart_count(&sup, "b"), 1);

    assert_eq!(state_path(sup.audit(), "a"), vec![Pending, Starting, Running, Healthy]);
    assert_eq!(restart_count(&sup, "a"), 0);
    assert_eq!(fake.spawn_count("a"), 1);
    Ok(())
}

#[tokio::test]
async fn failing_probes_past_the_threshold_trigger_a_restart() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    // Healthy once, then two failures cross the threshold. The spare failure
    // is absorbed either while the retry is pending or by the new instance.
    fake.script_probes("api", &[true, false, false, false]);
    let manifest = ManifestBuilder::new()
        .service(
            ServiceBuilder::command("api", "api")
                .probed(2)
                .backoff(Duration::from_millis(1), Duration::from_millis(1)),
        )
        .build();
    let sup = spawn(manifest, &fake);

    with_timeout(sup.start(Selection::All)).await?;
    wait_until(|| {
        restart_count(&sup, "api") == 1
            && sup.state().get("api").is_some_and(|s| s.state == Healthy)
    })
    .await;

    assert_eq!(fake.spawn_count("api"), 2);
    assert_eq!(fake.live_instances("api"), 1);
    // The old instance is torn down with a forced stop before the retry.
    assert_eq!(fake.stops(), vec![("api".to_string(), true)]);

    let path = state_path(sup.audit(), "api");
    assert_eq!(
        &path[..7],
        &[Pending, Starting, Running, Healthy, Unhealthy, Restarting, Starting]
    );
    Ok(())
}

#[tokio::test]
async fn a_healthy_probe_before_the_retry_cancels_it() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    fake.script_probes("api", &[true, false]);
    let manifest = ManifestBuilder::new()
        .service(
            ServiceBuilder::command("api", "api")
                .probed(1)
                .backoff(Duration::from_secs(5), Duration::from_secs(5)),
        )
        .build();
    let sup = spawn(manifest, &fake);

    with_timeout(sup.start(Selection::All)).await?;
    wait_until(|| state_path(sup.audit(), "api").len() >= 6).await;

    assert_eq!(
        state_path(sup.audit(), "api"),
        vec![Pending, Starting, Running, Healthy, Unhealthy, Healthy]
    );
    assert_eq!(restart_count(&sup, "api"), 0);
    assert_eq!(fake.spawn_count("api"), 1);
    assert!(fake.stops().is_empty());
    Ok(())
}

#[tokio::test]
async fn a_crashed_process_is_restarted() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("worker", "worker"))
        .build();
    let sup = spawn(manifest, &fake);

    with_timeout(sup.start(Selection::All)).await?;
    fake.crash("worker", false);

    wait_until(|| {
        restart_count(&sup, "worker") == 1
            && sup.state().get("worker").is_some_and(|s| s.state == Running)
    })
    .await;

    assert_eq!(fake.spawn_count("worker"), 2);
    let snap = sup.state().get("worker").ok_or("worker missing")?;
    assert!(snap.last_error.is_some_and(|e| e.contains("exited")));
    Ok(())
}

#[tokio::test]
async fn a_clean_exit_under_on_failure_stops_and_degrades_dependents() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("job", "job"))
        .service(ServiceBuilder::command("reader", "reader").depends_on("job"))
        .build();
    let sup = spawn(manifest, &fake);

    with_timeout(sup.start(Selection::All)).await?;
    fake.crash("job", true);

    wait_for_state(sup.state(), "job", Stopped).await;
    wait_until(|| sup.state().get("reader").is_some_and(|s| s.degraded)).await;

    assert_eq!(restart_count(&sup, "job"), 0);
    assert_eq!(fake.spawn_count("job"), 1);
    // Degraded, not stopped: clean exits never cascade.
    assert_eq!(sup.state().get("reader").map(|s| s.state), Some(Running));
    Ok(())
}

#[tokio::test]
async fn always_policy_restarts_after_a_clean_exit() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("daemon", "daemon").restart(RestartPolicyKind::Always))
        .build();
    let sup = spawn(manifest, &fake);

    with_timeout(sup.start(Selection::All)).await?;
    fake.crash("daemon", true);

    wait_until(|| fake.spawn_count("daemon") == 2).await;
    wait_for_state(sup.state(), "daemon", Running).await;
    assert_eq!(restart_count(&sup, "daemon"), 1);
    Ok(())
}

#[tokio::test]
async fn recovering_between_crashes_does_not_refill_the_retry_budget() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("worker", "worker").max_retries(1))
        .build();
    let sup = spawn(manifest, &fake);

    with_timeout(sup.start(Selection::All)).await?;

    fake.crash("worker", false);
    wait_until(|| {
        restart_count(&sup, "worker") == 1
            && sup.state().get("worker").is_some_and(|s| s.state == Running)
    })
    .await;

    // Back up and running, but the single retry is spent.
    fake.crash("worker", false);
    wait_for_state(sup.state(), "worker", Failed).await;

    assert_eq!(restart_count(&sup, "worker"), 1);
    assert_eq!(fake.spawn_count("worker"), 2);
    let snap = sup.state().get("worker").ok_or("worker missing")?;
    assert!(snap.last_error.is_some_and(|e| e.contains("retry budget exhausted")));

    // An operator start grants a fresh budget.
    let results = with_timeout(sup.start(Selection::All)).await?;
    assert!(matches!(results["worker"], Ok(Running)));
    fake.crash("worker", false);
    wait_until(|| {
        restart_count(&sup, "worker") == 2
            && sup.state().get("worker").is_some_and(|s| s.state == Running)
    })
    .await;
    assert_eq!(fake.spawn_count("worker"), 4);
    Ok(())
}

#[tokio::test]
async fn force_stop_cancels_a_pending_retry() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    fake.fail_all_starts("svc", "port in use");
    let manifest = ManifestBuilder::new()
        .service(
            ServiceBuilder::command("svc", "svc")
                .backoff(Duration::from_millis(300), Duration::from_millis(300)),
        )
        .build();
    let sup = spawn(manifest, &fake);

    let starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.start(Selection::All).await })
    };
    wait_for_state(sup.state(), "svc", Unhealthy).await;

    let results = with_timeout(sup.stop(Selection::one("svc"), true)).await?;
    assert!(matches!(results["svc"], Ok(Stopped)));

    let started = with_timeout(starter).await??;
    assert!(matches!(started["svc"], Err(LaunchError::ServiceFailed { .. })));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fake.start_calls("svc"), 1);
    assert_eq!(restart_count(&sup, "svc"), 0);
    assert_eq!(sup.state().get("svc").map(|s| s.state), Some(Stopped));
    Ok(())
}
