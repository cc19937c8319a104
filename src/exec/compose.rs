// src/exec/compose.rs

//! `docker compose` stacks.
//!
//! The adapter shells out to the compose CLI; it never talks to a container
//! runtime directly. The binary and its leading arguments are configurable
//! so tests (and podman users) can substitute their own.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, info};

use crate::exec::{AdapterFuture, ExecutionAdapter, HandleKind, ServiceHandle, StartContext};
use crate::manifest::{ComposeStack, Execution};

#[derive(Debug, Clone)]
pub struct ComposeAdapter {
    program: String,
    base_args: Vec<String>,
    grace_period: Duration,
}

impl ComposeAdapter {
    /// `docker compose ...`
    pub fn new(grace_period: Duration) -> Self {
        Self::with_binary("docker", ["compose"], grace_period)
    }

    pub fn with_binary<I, S>(program: impl Into<String>, base_args: I, grace_period: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            base_args: base_args.into_iter().map(Into::into).collect(),
            grace_period,
        }
    }

    fn command(&self, stack: &ComposeStack, env: &BTreeMap<String, String>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("-f")
            .arg(&stack.file)
            .arg("-p")
            .arg(&stack.project)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run one compose subcommand and return its stdout.
    async fn run(
        &self,
        stack: &ComposeStack,
        env: &BTreeMap<String, String>,
        args: &[String],
    ) -> Result<String> {
        let mut cmd = self.command(stack, env);
        cmd.args(args).args(&stack.services);

        debug!(project = %stack.project, ?args, "running compose command");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("running {} for project '{}'", self.program, stack.project))?;

        if !output.status.success() {
            bail!(
                "compose {:?} for project '{}' exited with {}: {}",
                args,
                stack.project,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn running(&self, stack: &ComposeStack, env: &BTreeMap<String, String>) -> Result<bool> {
        let args = ["ps", "--status", "running", "-q"].map(String::from);
        let stdout = self.run(stack, env, &args).await?;
        let containers = stdout.lines().filter(|l| !l.trim().is_empty()).count();
        Ok(containers > 0 && containers >= stack.services.len())
    }
}

/// `stop -t` takes whole seconds; round up so a sub-second grace period is
/// not turned into an immediate kill.
fn grace_seconds(grace: Duration) -> u64 {
    grace.as_secs() + u64::from(grace.subsec_nanos() > 0)
}

fn compose_parts(handle: &ServiceHandle) -> Option<(&ComposeStack, &BTreeMap<String, String>)> {
    match handle.kind() {
        HandleKind::Compose { stack } => Some((stack, handle.env())),
        _ => None,
    }
}

impl ExecutionAdapter for ComposeAdapter {
    fn start(&self, ctx: StartContext) -> AdapterFuture<'_, anyhow::Result<ServiceHandle>> {
        Box::pin(async move {
            if let Some(existing) = &ctx.existing {
                if let Some((stack, env)) = compose_parts(existing) {
                    if self.running(stack, env).await.unwrap_or(false) {
                        debug!(service = %ctx.service(), "compose stack already running");
                        return Ok(existing.clone());
                    }
                }
            }

            let Execution::Compose(stack) = &ctx.definition.execution else {
                bail!("service '{}' is not a compose service", ctx.service());
            };

            info!(
                service = %ctx.service(),
                file = %stack.file.display(),
                project = %stack.project,
                "bringing up compose stack"
            );
            let args = ["up", "-d"].map(String::from);
            tokio::time::timeout(ctx.timeout, self.run(stack, &ctx.env, &args))
                .await
                .map_err(|_| anyhow::anyhow!("compose up did not finish within {:?}", ctx.timeout))??;

            Ok(ServiceHandle::new(
                ctx.service(),
                HandleKind::Compose {
                    stack: stack.clone(),
                },
            )
            .with_env(ctx.env.clone()))
        })
    }

    fn stop<'a>(
        &'a self,
        handle: &'a ServiceHandle,
        force: bool,
    ) -> AdapterFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let Some((stack, env)) = compose_parts(handle) else {
                bail!("handle for '{}' is not a compose handle", handle.service());
            };

            info!(service = %handle.service(), project = %stack.project, force, "stopping compose stack");
            let args: Vec<String> = if force {
                vec!["kill".into()]
            } else {
                vec![
                    "stop".into(),
                    "-t".into(),
                    grace_seconds(self.grace_period).to_string(),
                ]
            };
            self.run(stack, env, &args).await.map(|_| ())
        })
    }

    fn is_alive<'a>(&'a self, handle: &'a ServiceHandle) -> AdapterFuture<'a, bool> {
        Box::pin(async move {
            match compose_parts(handle) {
                Some((stack, env)) => self.running(stack, env).await.unwrap_or(false),
                None => false,
            }
        })
    }
}
