pub mod builders;
pub mod fake_adapter;

use std::sync::Once;
use std::time::Duration;

use launchvisor::state::{ServiceState, StateManager};
use launchvisor::telemetry::AuditLog;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// Poll the state manager until `service` reports `state`.
pub async fn wait_for_state(state: &StateManager, service: &str, expected: ServiceState) {
    with_timeout(async {
        loop {
            if state.get(service).is_some_and(|s| s.state == expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Poll `condition` every few milliseconds until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    with_timeout(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// `(from, to)` pairs recorded for `service`, skipping degraded-only events.
pub fn transitions(audit: &AuditLog, service: &str) -> Vec<(ServiceState, ServiceState)> {
    audit
        .events(Some(service))
        .into_iter()
        .filter(|e| e.from != e.to)
        .map(|e| (e.from, e.to))
        .collect()
}

/// The sequence of states `service` went through, starting with the first
/// `from`.
pub fn state_path(audit: &AuditLog, service: &str) -> Vec<ServiceState> {
    let pairs = transitions(audit, service);
    let mut path: Vec<ServiceState> = pairs.first().map(|(from, _)| *from).into_iter().collect();
    path.extend(pairs.into_iter().map(|(_, to)| to));
    path
}
