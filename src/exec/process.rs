// src/exec/process.rs

//! Child process management shared by the command and protocol-server
//! adapters.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::manifest::ProcessSpec;
use crate::types::ServiceId;

/// A spawned child plus its observed exit status.
#[derive(Debug)]
pub struct ManagedProcess {
    service: ServiceId,
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
    exit: Mutex<Option<ExitStatus>>,
}

impl ManagedProcess {
    /// Spawn `spec` with exactly `env` as its environment.
    ///
    /// stdout and stderr are drained into `tracing` at debug level. If
    /// `ready_on_stdout` is given, the returned receiver fires on the first
    /// stdout line matching it.
    pub fn spawn(
        service: &str,
        spec: &ProcessSpec,
        env: &BTreeMap<String, String>,
        ready_on_stdout: Option<Regex>,
    ) -> Result<(Self, Option<oneshot::Receiver<()>>)> {
        info!(
            service = %service,
            program = %spec.program,
            args = ?spec.args,
            "spawning service process"
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning '{}' for service '{service}'", spec.program))?;

        let pid = child.id();
        let (ready_tx, ready_rx) = match ready_on_stdout {
            Some(re) => {
                let (tx, rx) = oneshot::channel();
                (Some((re, tx)), Some(rx))
            }
            None => (None, None),
        };

        if let Some(stdout) = child.stdout.take() {
            let service = service.to_string();
            tokio::spawn(async move {
                let mut ready = ready_tx;
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(service = %service, "stdout: {}", line);
                    if ready.as_ref().is_some_and(|(re, _)| re.is_match(&line)) {
                        if let Some((_, tx)) = ready.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let service = service.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(service = %service, "stderr: {}", line);
                }
            });
        }

        let process = Self {
            service: service.to_string(),
            pid,
            child: tokio::sync::Mutex::new(child),
            exit: Mutex::new(None),
        };
        Ok((process, ready_rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once an exit has been observed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.exit.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn record_exit(&self, status: ExitStatus) {
        debug!(service = %self.service, ?status, "service process exited");
        match self.exit.lock() {
            Ok(mut guard) => *guard = Some(status),
            Err(poisoned) => *poisoned.into_inner() = Some(status),
        }
    }

    pub async fn is_alive(&self) -> bool {
        if self.exit_status().is_some() {
            return false;
        }
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Err(e) => {
                warn!(service = %self.service, error = %e, "failed to poll service process");
                false
            }
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn terminate(&self, grace: Duration) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(status) = child.try_wait()? {
            self.record_exit(status);
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(service = %self.service, pid, error = %e, "SIGTERM failed");
                }
            }
        }

        #[cfg(not(unix))]
        {
            child.start_kill()?;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                let status = status
                    .with_context(|| format!("waiting for service '{}' to exit", self.service))?;
                self.record_exit(status);
            }
            Err(_) => {
                warn!(
                    service = %self.service,
                    grace_ms = grace.as_millis() as u64,
                    "process did not exit within grace period; killing"
                );
                child
                    .kill()
                    .await
                    .with_context(|| format!("killing service '{}'", self.service))?;
                if let Some(status) = child.try_wait()? {
                    self.record_exit(status);
                }
            }
        }

        Ok(())
    }

    /// Immediate SIGKILL.
    pub async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(status) = child.try_wait()? {
            self.record_exit(status);
            return Ok(());
        }
        child
            .kill()
            .await
            .with_context(|| format!("killing service '{}'", self.service))?;
        if let Some(status) = child.try_wait()? {
            self.record_exit(status);
        }
        Ok(())
    }
}
