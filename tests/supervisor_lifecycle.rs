// tests/supervisor_lifecycle.rs

mod common;
use crate::common::builders::{ManifestBuilder, ServiceBuilder};
use crate::common::fake_adapter::FakeAdapter;
use crate::common::{init_tracing, state_path, wait_until, with_timeout};

use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;

use launchvisor::errors::LaunchError;
use launchvisor::manifest::Manifest;
use launchvisor::state::ServiceState;
use launchvisor::supervisor::{Selection, Supervisor, SupervisorHandle};

type TestResult = Result<(), Box<dyn Error>>;

/// db <- api, db <- worker. Only db and api declare a health check.
fn stack() -> Manifest {
    ManifestBuilder::new()
        .service(ServiceBuilder::command("db", "postgres").probed(2))
        .service(ServiceBuilder::command("api", "api").depends_on("db").probed(1))
        .service(ServiceBuilder::command("worker", "worker").depends_on("db"))
        .build()
}

fn spawn(manifest: Manifest, fake: &FakeAdapter) -> SupervisorHandle {
    Supervisor::spawn(manifest, BTreeMap::new(), fake.registry())
}

#[tokio::test]
async fn start_all_then_status_reports_every_service_ready() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = spawn(stack(), &fake);

    let results = with_timeout(sup.start(Selection::All)).await?;
    assert_eq!(results.len(), 3);
    for (id, result) in &results {
        assert!(result.is_ok(), "{id} did not start: {result:?}");
    }

    let status = sup.status(&Selection::All)?;
    assert_eq!(status.len(), 3);
    for snap in &status {
        let expected = if snap.service == "worker" {
            ServiceState::Running
        } else {
            ServiceState::Healthy
        };
        assert_eq!(snap.state, expected, "{}", snap.service);
        assert_eq!(snap.restart_count, 0);
        assert!(!snap.degraded);
    }

    assert_eq!(fake.spawn_order().first().map(String::as_str), Some("db"));
    assert_eq!(
        state_path(sup.audit(), "api"),
        vec![
            ServiceState::Pending,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Healthy
        ]
    );

    with_timeout(sup.shutdown()).await?;
    Ok(())
}

#[tokio::test]
async fn starting_a_running_service_again_is_a_no_op() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = spawn(stack(), &fake);

    with_timeout(sup.start(Selection::All)).await?;
    let events = sup.audit().len();

    let again = with_timeout(sup.start(Selection::one("db"))).await?;
    assert!(matches!(again.get("db"), Some(Ok(ServiceState::Healthy))));
    assert_eq!(fake.spawn_count("db"), 1);
    assert_eq!(fake.start_calls("db"), 1);
    assert_eq!(sup.audit().len(), events, "no transitions for a no-op start");
    Ok(())
}

#[tokio::test]
async fn starting_a_subset_pulls_in_its_dependencies_only() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = spawn(stack(), &fake);

    let results = with_timeout(sup.start(Selection::one("api"))).await?;
    assert_eq!(results.keys().collect::<Vec<_>>(), vec!["api"]);
    assert!(matches!(results["api"], Ok(ServiceState::Healthy)));

    assert_eq!(sup.state().get("db").map(|s| s.state), Some(ServiceState::Healthy));
    assert_eq!(sup.state().get("worker").map(|s| s.state), Some(ServiceState::Pending));
    assert_eq!(fake.spawn_count("worker"), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_services_are_rejected_per_id() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = spawn(stack(), &fake);

    let results = with_timeout(sup.start(Selection::from_ids(vec![
        "ghost".to_string(),
        "worker".to_string(),
    ])))
    .await?;

    assert!(matches!(&results["ghost"], Err(LaunchError::UnknownService(id)) if id == "ghost"));
    assert!(matches!(results["worker"], Ok(ServiceState::Running)));

    let err = sup.status(&Selection::one("ghost")).expect_err("ghost is unknown");
    assert!(matches!(err, LaunchError::UnknownService(_)));
    Ok(())
}

#[tokio::test]
async fn stop_takes_dependents_down_first() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("a", "a"))
        .service(ServiceBuilder::command("b", "b").depends_on("a"))
        .service(ServiceBuilder::command("c", "c").depends_on("b"))
        .service(ServiceBuilder::command("other", "other"))
        .build();
    let sup = spawn(manifest, &fake);
    fake.set_stop_delay(Duration::from_millis(20));

    with_timeout(sup.start(Selection::All)).await?;
    let results = with_timeout(sup.stop(Selection::one("a"), false)).await?;

    assert!(matches!(results["a"], Ok(ServiceState::Stopped)));
    assert_eq!(fake.stop_order(), vec!["c", "b", "a"]);
    assert!(fake.stops().iter().all(|(_, force)| !force));
    assert_eq!(sup.state().get("other").map(|s| s.state), Some(ServiceState::Running));
    for id in ["a", "b", "c"] {
        assert_eq!(sup.state().get(id).map(|s| s.state), Some(ServiceState::Stopped));
        assert_eq!(fake.live_instances(id), 0);
    }
    Ok(())
}

#[tokio::test]
async fn stopped_services_start_again_on_request() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = spawn(stack(), &fake);

    with_timeout(sup.start(Selection::All)).await?;
    with_timeout(sup.stop(Selection::All, false)).await?;
    let results = with_timeout(sup.start(Selection::one("worker"))).await?;

    assert!(matches!(results["worker"], Ok(ServiceState::Running)));
    assert_eq!(fake.spawn_count("worker"), 2);
    assert_eq!(fake.spawn_count("db"), 2);
    assert_eq!(fake.spawn_count("api"), 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_everything_and_closes_the_handle() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = spawn(stack(), &fake);

    with_timeout(sup.start(Selection::All)).await?;
    let results = with_timeout(sup.shutdown()).await?;

    assert_eq!(results.len(), 3);
    assert!(results.values().all(|r| matches!(r, Ok(ServiceState::Stopped))));
    let order = fake.stop_order();
    assert_eq!(order.last().map(String::as_str), Some("db"));

    wait_until(|| {
        ["db", "api", "worker"]
            .iter()
            .all(|id| fake.live_instances(id) == 0)
    })
    .await;

    let err = with_timeout(sup.start(Selection::All))
        .await
        .expect_err("control loop has exited");
    assert!(matches!(err, LaunchError::SupervisorGone));
    Ok(())
}

#[tokio::test]
async fn stopping_a_pending_service_needs_no_adapter_call() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = spawn(stack(), &fake);

    let results = with_timeout(sup.stop(Selection::one("worker"), false)).await?;
    assert!(matches!(results["worker"], Ok(ServiceState::Stopped)));
    assert!(fake.stops().is_empty());
    Ok(())
}

#[tokio::test]
async fn slow_starts_time_out_with_a_typed_error() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    fake.set_start_delay(Duration::from_secs(5));
    let manifest = ManifestBuilder::new()
        .start_timeout(Duration::from_millis(150))
        .service(ServiceBuilder::command("slow", "slow"))
        .service(ServiceBuilder::command("after", "after").depends_on("slow"))
        .build();
    let sup = spawn(manifest, &fake);

    let results = with_timeout(sup.start(Selection::All)).await?;

    assert!(matches!(
        &results["slow"],
        Err(LaunchError::Timeout { operation: "start", .. })
    ));
    match &results["after"] {
        Err(LaunchError::DependencyUnmet { waiting_on, .. }) => {
            assert_eq!(waiting_on, &vec!["slow".to_string()]);
        }
        other => return Err(format!("unexpected result {other:?}").into()),
    }
    Ok(())
}
