// src/lib.rs

pub mod cli;
pub mod dag;
pub mod errors;
pub mod exec;
pub mod health;
pub mod logging;
pub mod manifest;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod types;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command};
use crate::dag::DependencyGraph;
use crate::errors::LaunchError;
use crate::exec::AdapterRegistry;
use crate::manifest::loader::process_environment;
use crate::manifest::{Execution, Manifest, ProbeTarget, load_and_validate};
use crate::supervisor::{Selection, ServiceResults, Supervisor};
use crate::telemetry::http;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - manifest loading and validation
/// - adapter registry and supervisor control loop
/// - (optional) read-only status endpoint
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let path = args.manifest_path();
    let env = process_environment();

    match args.command {
        Command::Validate => validate(&path, env),
        Command::Plan => {
            let manifest = load_and_validate(&path, env)?;
            print_plan(&manifest);
            Ok(())
        }
        Command::Up {
            services,
            status_addr,
        } => up(&path, env, services, status_addr).await,
    }
}

fn validate(path: &Path, env: BTreeMap<String, String>) -> Result<()> {
    match load_and_validate(path, env) {
        Ok(manifest) => {
            println!(
                "{}: ok ({} service(s))",
                path.display(),
                manifest.len()
            );
            Ok(())
        }
        Err(LaunchError::Manifest(report)) => {
            for violation in report.iter() {
                println!("{violation}");
            }
            bail!(
                "{}: {} violation(s); nothing was started",
                path.display(),
                report.len()
            )
        }
        Err(e) => Err(e).with_context(|| format!("failed to read manifest {}", path.display())),
    }
}

async fn up(
    path: &Path,
    env: BTreeMap<String, String>,
    services: Vec<String>,
    status_addr: Option<String>,
) -> Result<()> {
    let manifest = load_and_validate(path, env.clone())?;
    info!(manifest = %path.display(), services = manifest.len(), "manifest loaded");

    let registry = AdapterRegistry::with_defaults(manifest.settings());
    let (supervisor, handle) = Supervisor::new(manifest, env, registry);
    let control_loop = tokio::spawn(supervisor.run());

    let (stop_status_tx, stop_status_rx) = tokio::sync::oneshot::channel::<()>();
    let status_task = match status_addr {
        Some(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind status endpoint on {addr}"))?;
            let shutdown = async move {
                let _ = stop_status_rx.await;
            };
            Some(tokio::spawn(http::serve(
                listener,
                handle.state().clone(),
                shutdown,
            )))
        }
        None => None,
    };

    let results = handle.start(Selection::from_ids(services)).await?;
    print_results("start", &results);

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    } else {
        info!("Ctrl+C received; shutting down");
    }

    let results = handle.shutdown().await?;
    print_results("stop", &results);

    let _ = stop_status_tx.send(());
    if let Some(task) = status_task {
        task.await??;
    }
    control_loop.await?;
    Ok(())
}

fn print_results(operation: &str, results: &ServiceResults) {
    for (service, result) in results {
        match result {
            Ok(state) => println!("{operation} {service}: {state}"),
            Err(e) => println!("{operation} {service}: error: {e}"),
        }
    }
}

/// Plan output: settings, start order and per-service configuration.
fn print_plan(manifest: &Manifest) {
    let settings = manifest.settings();
    println!("launchvisor plan");
    println!("  supervisor.workers = {}", settings.workers);
    println!("  supervisor.start_timeout = {:?}", settings.start_timeout);
    println!("  supervisor.call_timeout = {:?}", settings.call_timeout);
    println!("  supervisor.stop_grace_period = {:?}", settings.stop_grace_period);
    println!("  supervisor.cascade = {:?}", settings.cascade);
    println!();

    let graph = DependencyGraph::from_manifest(manifest);
    println!("start order ({}):", manifest.len());
    for id in graph.start_order() {
        let Some(def) = manifest.service(&id) else {
            continue;
        };
        println!("  - {id} [{}]", def.mode());
        match &def.execution {
            Execution::Command(process) => {
                println!("      command: {} {}", process.program, process.args.join(" "));
            }
            Execution::ProtocolServer(server) => {
                println!(
                    "      command: {} {}",
                    server.process.program,
                    server.process.args.join(" ")
                );
                if let Some(ref pattern) = server.ready_on_stdout {
                    println!("      ready_on_stdout: {pattern}");
                }
                if let Some(ref listen) = server.listen {
                    println!("      listen: {listen}");
                }
            }
            Execution::Compose(stack) => {
                println!("      compose: {} (project {})", stack.file.display(), stack.project);
            }
        }
        if !def.depends_on.is_empty() {
            println!("      depends_on: {:?}", def.depends_on);
        }
        println!(
            "      restart: {:?}, max_retries {:?}",
            def.restart.kind, def.restart.max_retries
        );
        if let Some(ref health) = def.health {
            let target = match &health.target {
                ProbeTarget::Command(c) => format!("command `{c}`"),
                ProbeTarget::Tcp(a) => format!("tcp {a}"),
                ProbeTarget::Http(u) => format!("http {u}"),
            };
            println!(
                "      health: {target} every {:?}, threshold {}",
                health.interval, health.failure_threshold
            );
        }
    }

    debug!("plan complete (no execution)");
}
