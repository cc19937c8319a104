// src/exec/protocol.rs

//! Long-running protocol servers (language servers, brokers, ...).
//!
//! Process management is the same as for command services; `start` only
//! returns once the server announced readiness, either by printing a line
//! matching `ready_on_stdout` or by accepting TCP connections on `listen`
//! (both, if both are declared). A server that exits during the wait, or
//! does not become ready within the start bound, fails the start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use regex::Regex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::exec::command::{reuse_live_handle, stop_process};
use crate::exec::{
    AdapterFuture, ExecutionAdapter, HandleKind, ManagedProcess, ServiceHandle, StartContext,
};
use crate::manifest::Execution;

const READINESS_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ProtocolServerAdapter {
    grace_period: Duration,
}

impl ProtocolServerAdapter {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

async fn wait_for_listen(addr: &str) {
    loop {
        match TcpStream::connect(addr).await {
            Ok(_) => return,
            Err(e) => {
                debug!(%addr, error = %e, "protocol server not accepting connections yet");
                tokio::time::sleep(READINESS_POLL).await;
            }
        }
    }
}

async fn wait_for_exit(process: &ManagedProcess) {
    while process.is_alive().await {
        tokio::time::sleep(READINESS_POLL).await;
    }
}

impl ExecutionAdapter for ProtocolServerAdapter {
    fn start(&self, ctx: StartContext) -> AdapterFuture<'_, anyhow::Result<ServiceHandle>> {
        Box::pin(async move {
            if let Some(handle) = reuse_live_handle(ctx.existing.as_ref()).await {
                return Ok(handle);
            }

            let Execution::ProtocolServer(spec) = &ctx.definition.execution else {
                bail!("service '{}' is not a protocol-server service", ctx.service());
            };

            let pattern = spec
                .ready_on_stdout
                .as_deref()
                .map(Regex::new)
                .transpose()
                .context("compiling ready_on_stdout")?;

            let (process, ready_rx) =
                ManagedProcess::spawn(ctx.service(), &spec.process, &ctx.env, pattern)
                    .context("protocol server adapter start")?;
            let process = Arc::new(process);

            let readiness = async {
                if let Some(rx) = ready_rx {
                    rx.await
                        .map_err(|_| anyhow!("stdout closed before the readiness line appeared"))?;
                    debug!(service = %ctx.service(), "readiness line seen on stdout");
                }
                if let Some(addr) = &spec.listen {
                    wait_for_listen(addr).await;
                    debug!(service = %ctx.service(), %addr, "listen address accepting connections");
                }
                Ok::<(), anyhow::Error>(())
            };

            let outcome = tokio::time::timeout(ctx.timeout, async {
                tokio::select! {
                    res = readiness => res,
                    _ = wait_for_exit(&process) => {
                        Err(anyhow!("process exited before becoming ready"))
                    }
                }
            })
            .await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    info!(service = %ctx.service(), "protocol server ready");
                    return Ok(ServiceHandle::new(ctx.service(), HandleKind::Process(process))
                        .with_env(ctx.env.clone()));
                }
                Ok(Err(e)) => e,
                Err(_) => anyhow!("not ready within {:?}", ctx.timeout),
            };

            if let Err(e) = process.kill().await {
                warn!(service = %ctx.service(), error = %e, "failed to kill unready protocol server");
            }
            Err(failure.context(format!("protocol server '{}' failed to start", ctx.service())))
        })
    }

    fn stop<'a>(
        &'a self,
        handle: &'a ServiceHandle,
        force: bool,
    ) -> AdapterFuture<'a, anyhow::Result<()>> {
        Box::pin(stop_process(handle, force, self.grace_period))
    }

    fn is_alive<'a>(&'a self, handle: &'a ServiceHandle) -> AdapterFuture<'a, bool> {
        Box::pin(async move {
            match handle.process() {
                Some(process) => process.is_alive().await,
                None => false,
            }
        })
    }
}
