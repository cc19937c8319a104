// src/exec/command.rs

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, info};

use crate::exec::{
    AdapterFuture, ExecutionAdapter, HandleKind, ManagedProcess, ServiceHandle, StartContext,
};
use crate::manifest::Execution;

/// Runs a service as a plain local process.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    grace_period: Duration,
}

impl CommandAdapter {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

/// Return the existing handle if its process is still running.
pub(crate) async fn reuse_live_handle(existing: Option<&ServiceHandle>) -> Option<ServiceHandle> {
    let handle = existing?;
    let process = handle.process()?;
    if process.is_alive().await {
        debug!(service = %handle.service(), instance = handle.instance(), "reusing live handle");
        Some(handle.clone())
    } else {
        None
    }
}

/// Shared stop logic for process-backed handles.
pub(crate) async fn stop_process(
    handle: &ServiceHandle,
    force: bool,
    grace: Duration,
) -> anyhow::Result<()> {
    let Some(process) = handle.process() else {
        bail!("handle for '{}' is not a process handle", handle.service());
    };

    info!(service = %handle.service(), pid = ?process.pid(), force, "stopping service process");
    if force {
        process.kill().await
    } else {
        process.terminate(grace).await
    }
}

impl ExecutionAdapter for CommandAdapter {
    fn start(&self, ctx: StartContext) -> AdapterFuture<'_, anyhow::Result<ServiceHandle>> {
        Box::pin(async move {
            if let Some(handle) = reuse_live_handle(ctx.existing.as_ref()).await {
                return Ok(handle);
            }

            let Execution::Command(spec) = &ctx.definition.execution else {
                bail!("service '{}' is not a command service", ctx.service());
            };

            let (process, _) = ManagedProcess::spawn(ctx.service(), spec, &ctx.env, None)
                .context("command adapter start")?;
            Ok(ServiceHandle::new(
                ctx.service(),
                HandleKind::Process(Arc::new(process)),
            )
            .with_env(ctx.env))
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
