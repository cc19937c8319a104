// tests/supervisor_control.rs

mod common;
use crate::common::builders::{ManifestBuilder, ServiceBuilder};
use crate::common::fake_adapter::FakeAdapter;
use crate::common::{env_of, init_tracing, wait_for_state, wait_until, with_timeout};

use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;

use chrono::Utc;

use launchvisor::errors::LaunchError;
use launchvisor::manifest::ValidationCheck;
use launchvisor::state::ServiceState;
use launchvisor::supervisor::{Selection, Supervisor};

type TestResult = Result<(), Box<dyn Error>>;

fn keyed_manifest() -> ManifestBuilder {
    ManifestBuilder::new()
        .declare_env("API_KEY")
        .service(ServiceBuilder::command("api", "api").required_env("API_KEY"))
}

#[tokio::test]
async fn required_env_is_rechecked_at_start() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = keyed_manifest().build_with_env(&env_of(&[("API_KEY", "k")]));
    // The supervisor's own environment lacks the variable.
    let sup = Supervisor::spawn(manifest, BTreeMap::new(), fake.registry());

    let results = with_timeout(sup.start(Selection::All)).await?;
    match &results["api"] {
        Err(LaunchError::RequiredEnv { service, missing }) => {
            assert_eq!(service, "api");
            assert_eq!(missing, &vec!["API_KEY".to_string()]);
        }
        other => return Err(format!("unexpected result {other:?}").into()),
    }
    assert_eq!(fake.start_calls("api"), 0);
    assert_eq!(sup.state().get("api").map(|s| s.state), Some(ServiceState::Failed));

    with_timeout(sup.set_environment(env_of(&[("API_KEY", "k")]))).await?;
    let results = with_timeout(sup.start(Selection::All)).await?;
    assert!(matches!(results["api"], Ok(ServiceState::Running)));
    assert_eq!(fake.spawn_count("api"), 1);
    Ok(())
}

#[tokio::test]
async fn validate_uses_the_current_environment_and_touches_nothing() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let running = ManifestBuilder::new()
        .service(ServiceBuilder::command("base", "base"))
        .build();
    let sup = Supervisor::spawn(running, BTreeMap::new(), fake.registry());

    let report = with_timeout(sup.validate(keyed_manifest().raw())).await?;
    assert_eq!(report.len(), 1);
    assert_eq!(report.violations()[0].check, ValidationCheck::RequiredEnv);

    with_timeout(sup.set_environment(env_of(&[("API_KEY", "k")]))).await?;
    let report = with_timeout(sup.validate(keyed_manifest().raw())).await?;
    assert!(report.is_empty(), "{report}");

    let cyclic = ManifestBuilder::new()
        .service(ServiceBuilder::command("x", "x").depends_on("y"))
        .service(ServiceBuilder::command("y", "y").depends_on("x"))
        .raw();
    let report = with_timeout(sup.validate(cyclic)).await?;
    assert_eq!(report.by_check(ValidationCheck::Cycle).count(), 1);

    assert_eq!(fake.start_calls("base"), 0);
    assert_eq!(sup.status(&Selection::All)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn reload_adds_and_removes_services() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let initial = ManifestBuilder::new()
        .service(ServiceBuilder::command("old", "old"))
        .build();
    let sup = Supervisor::spawn(initial, BTreeMap::new(), fake.registry());
    with_timeout(sup.start(Selection::All)).await?;

    let both = ManifestBuilder::new()
        .service(ServiceBuilder::command("old", "old"))
        .service(ServiceBuilder::command("new", "new").depends_on("old"))
        .build();
    with_timeout(sup.reload(both)).await?;

    let status = sup.status(&Selection::All)?;
    let states: Vec<_> = status.iter().map(|s| (s.service.as_str(), s.state)).collect();
    assert_eq!(
        states,
        vec![("new", ServiceState::Pending), ("old", ServiceState::Running)]
    );
    assert_eq!(fake.spawn_count("new"), 0, "reload never starts anything");

    let results = with_timeout(sup.start(Selection::one("new"))).await?;
    assert!(matches!(results["new"], Ok(ServiceState::Running)));

    let replacement = ManifestBuilder::new()
        .service(ServiceBuilder::command("solo", "solo"))
        .build();
    with_timeout(sup.reload(replacement)).await?;

    let ids: Vec<_> = sup
        .status(&Selection::All)?
        .into_iter()
        .map(|s| s.service)
        .collect();
    assert_eq!(ids, vec!["solo"]);
    wait_until(|| fake.live_instances("old") == 0 && fake.live_instances("new") == 0).await;
    let mut stopped = fake.stop_order();
    stopped.sort();
    assert_eq!(stopped, vec!["new", "old"]);

    let err = sup.status(&Selection::one("old")).expect_err("old was removed");
    assert!(matches!(err, LaunchError::UnknownService(_)));
    Ok(())
}

#[tokio::test]
async fn event_tail_replays_the_backlog_then_follows_live() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("a", "a"))
        .service(ServiceBuilder::command("b", "b"))
        .build();
    let sup = Supervisor::spawn(manifest, BTreeMap::new(), fake.registry());

    with_timeout(sup.start(Selection::one("a"))).await?;

    let mut tail = sup.tail_events(Some("b".to_string()), None);
    assert!(tail.try_next().is_none(), "b has no history yet");

    let mut everything = sup.tail_events(None, None);
    let first = everything.try_next().ok_or("backlog missing")?;
    assert_eq!(first.sequence, 0);
    assert_eq!(first.service, "a");

    with_timeout(sup.start(Selection::one("b"))).await?;
    let starting = with_timeout(tail.next()).await.ok_or("tail closed")?;
    let running = with_timeout(tail.next()).await.ok_or("tail closed")?;

    assert_eq!((starting.from, starting.to), (ServiceState::Pending, ServiceState::Starting));
    assert_eq!((running.from, running.to), (ServiceState::Starting, ServiceState::Running));
    assert_eq!(starting.correlation_id, running.correlation_id);
    assert!(starting.sequence < running.sequence);
    assert!(starting.timestamp <= running.timestamp);

    let mut future = sup.tail_events(None, Some(Utc::now() + chrono::Duration::hours(1)));
    assert!(future.try_next().is_none());
    Ok(())
}

#[tokio::test]
async fn metrics_track_restarts_uptime_and_probe_latency() -> TestResult {
    init_tracing();
    let fake = FakeAdapter::new();
    let manifest = ManifestBuilder::new()
        .service(ServiceBuilder::command("probed", "probed").probed(1))
        .service(ServiceBuilder::command("plain", "plain"))
        .build();
    let sup = Supervisor::spawn(manifest, BTreeMap::new(), fake.registry());

    with_timeout(sup.start(Selection::All)).await?;
    fake.crash("plain", false);
    wait_until(|| sup.state().get("plain").is_some_and(|s| s.restart_count == 1)).await;
    wait_for_state(sup.state(), "plain", ServiceState::Running).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let metrics = sup.metrics();
    assert_eq!(metrics.len(), 2);

    let probed = &metrics["probed"];
    assert_eq!(probed.restart_count, 0);
    assert_eq!(probed.last_probe_latency, Some(Duration::from_millis(1)));
    assert!(probed.uptime.is_some_and(|u| u > Duration::ZERO));

    let plain = &metrics["plain"];
    assert_eq!(plain.restart_count, 1);
    assert_eq!(plain.last_probe_latency, None);
    assert!(plain.uptime.is_some());

    with_timeout(sup.stop(Selection::one("plain"), false)).await?;
    assert_eq!(sup.metrics()["plain"].uptime, None);
    Ok(())
}
