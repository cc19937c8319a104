// tests/supervisor_cascade.rs

mod common;
use crate::common::builders::{ManifestBuilder, ServiceBuilder};
use crate::common::fake_adapter::FakeAdapter;
use crate::common::{init_tracing, wait_for_state, wait_until, with_timeout};

use std::collections::BTreeMap;
use std::error::Error;

use launchvisor::manifest::Manifest;
use launchvisor::state::ServiceState;
use launchvisor::supervisor::{Selection, Supervisor, SupervisorHandle};
use launchvisor::types::{CascadeMode, RestartPolicyKind};

type TestResult = Result<(), Box<dyn Error>>;

/// db <- api <- web, plus an unrelated `metrics` service. db never restarts.
fn chain(cascade: CascadeMode) -> Manifest {
    ManifestBuilder::new()
        .cascade(cascade)
        .service(ServiceBuilder::command("db", "postgres").restart(RestartPolicyKind::Never))
        .service(ServiceBuilder::command("api", "api").depends_on("db"))
        .service(ServiceBuilder::command("web", "web").depends_on("api"))
        .service(ServiceBuilder::command("metrics", "metrics"))
        .build()
}

async fn started(cascade: CascadeMode, fake: &FakeAdapter) -> Result<SupervisorHandle, Box<dyn Error>> {
    let sup = Supervisor::spawn(chain(cascade), BTreeMap::new(), fake.registry());
    let results = with_timeout(sup.start(Selection::All)).await?;
    assert!(results.values().all(Result::is_ok), "{results:?}");
    Ok(sup)
}

fn snapshot_of(sup: &SupervisorHandle, id: &str) -> (ServiceState, bool) {
    sup.state()
        .get(id)
        .map(|s| (s.state, s.degraded))
        .unwrap_or((ServiceState::Pending, false))
}

#[tokio::test]
async fn failure_stops_dependents_in_reverse_order() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = started(CascadeMode::Stop, &fake).await?;

    fake.crash("db", false);
    wait_for_state(sup.state(), "api", ServiceState::Stopped).await;
    wait_for_state(sup.state(), "web", ServiceState::Stopped).await;

    assert_eq!(snapshot_of(&sup, "db").0, ServiceState::Failed);
    assert_eq!(snapshot_of(&sup, "api"), (ServiceState::Stopped, true));
    assert_eq!(snapshot_of(&sup, "web"), (ServiceState::Stopped, true));
    assert_eq!(snapshot_of(&sup, "metrics"), (ServiceState::Running, false));
    // db exited on its own, so only its dependents need an adapter stop.
    assert_eq!(fake.stop_order(), vec!["web", "api"]);
    Ok(())
}

#[tokio::test]
async fn dependents_are_degraded_in_the_same_step_as_the_failure() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = started(CascadeMode::Stop, &fake).await?;

    fake.crash("db", false);
    wait_for_state(sup.state(), "web", ServiceState::Stopped).await;

    let events = sup.audit().events(None);
    let failed = events
        .iter()
        .find(|e| e.service == "db" && e.to == ServiceState::Failed)
        .ok_or("db never failed")?;

    let next: Vec<_> = events
        .iter()
        .filter(|e| e.sequence > failed.sequence)
        .take(2)
        .collect();
    assert_eq!(next.len(), 2);
    for event in next {
        assert_eq!(event.from, event.to, "degraded-only event expected: {event:?}");
        assert!(event.degraded);
        assert!(event.detail.contains("db"), "{}", event.detail);
        assert!(event.service == "api" || event.service == "web");
    }
    Ok(())
}

#[tokio::test]
async fn degrade_mode_keeps_dependents_running() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = started(CascadeMode::Degrade, &fake).await?;

    fake.crash("db", false);
    wait_for_state(sup.state(), "db", ServiceState::Failed).await;

    assert_eq!(snapshot_of(&sup, "api"), (ServiceState::Running, true));
    assert_eq!(snapshot_of(&sup, "web"), (ServiceState::Running, true));
    assert!(fake.stops().is_empty());

    // Recovery clears the flag in the same step that makes db ready.
    let results = with_timeout(sup.start(Selection::one("db"))).await?;
    assert!(matches!(results["db"], Ok(ServiceState::Running)));
    assert_eq!(snapshot_of(&sup, "api"), (ServiceState::Running, false));
    assert_eq!(snapshot_of(&sup, "web"), (ServiceState::Running, false));
    assert_eq!(fake.spawn_count("api"), 1);
    Ok(())
}

#[tokio::test]
async fn cascade_stopped_dependents_come_back_with_their_dependency() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = started(CascadeMode::Stop, &fake).await?;

    fake.crash("db", false);
    wait_for_state(sup.state(), "web", ServiceState::Stopped).await;

    with_timeout(sup.start(Selection::one("db"))).await?;
    wait_for_state(sup.state(), "web", ServiceState::Running).await;

    assert_eq!(snapshot_of(&sup, "api"), (ServiceState::Running, false));
    assert_eq!(fake.spawn_count("api"), 2);
    assert_eq!(fake.spawn_count("web"), 2);
    assert_eq!(fake.spawn_count("metrics"), 1);
    Ok(())
}

#[tokio::test]
async fn operator_stopped_services_stay_down_while_dependencies_restart() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = started(CascadeMode::Stop, &fake).await?;

    with_timeout(sup.stop(Selection::one("web"), false)).await?;
    assert_eq!(snapshot_of(&sup, "web"), (ServiceState::Stopped, false));
    assert_eq!(snapshot_of(&sup, "api"), (ServiceState::Running, false));

    // Restarting api must not bring web back: it is no longer wanted.
    fake.crash("api", false);
    wait_until(|| fake.spawn_count("api") == 2).await;
    wait_for_state(sup.state(), "api", ServiceState::Running).await;
    assert_eq!(fake.spawn_count("web"), 1);
    assert_eq!(snapshot_of(&sup, "web"), (ServiceState::Stopped, false));
    Ok(())
}

#[tokio::test]
async fn cascade_mode_from_a_reload_applies_immediately() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let sup = started(CascadeMode::Stop, &fake).await?;

    with_timeout(sup.reload(chain(CascadeMode::Degrade))).await?;
    fake.crash("db", false);

    wait_for_state(sup.state(), "db", ServiceState::Failed).await;
    wait_until(|| snapshot_of(&sup, "web").1).await;

    assert_eq!(snapshot_of(&sup, "api"), (ServiceState::Running, true));
    assert_eq!(snapshot_of(&sup, "web"), (ServiceState::Running, true));
    assert!(fake.stop_order().is_empty(), "{:?}", fake.stop_order());
    Ok(())
}
