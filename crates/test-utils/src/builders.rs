#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use launchvisor::manifest::model::{
    ComposeConfig, HealthConfig, RestartConfig, ServiceConfig, SupervisorSection,
};
use launchvisor::manifest::{Manifest, MaxRetries, RawManifest, ValidationContext, validate};
use launchvisor::types::{CascadeMode, ExecutionMode, HealthCheckKind, RestartPolicyKind};

/// Builder for `Manifest` with timings small enough for tests.
pub struct ManifestBuilder {
    manifest: RawManifest,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            manifest: RawManifest {
                supervisor: SupervisorSection {
                    workers: 4,
                    start_timeout: Duration::from_secs(5),
                    call_timeout: Duration::from_secs(2),
                    stop_grace_period: Duration::from_millis(200),
                    cascade: Some(CascadeMode::Stop),
                    retry_ceiling: 20,
                    liveness_interval: Duration::from_millis(20),
                },
                ..RawManifest::default()
            },
        }
    }

    pub fn service(mut self, service: ServiceBuilder) -> Self {
        self.manifest.service.push(service.build());
        self
    }

    pub fn cascade(mut self, mode: CascadeMode) -> Self {
        self.manifest.supervisor.cascade = Some(mode);
        self
    }

    pub fn no_cascade(mut self) -> Self {
        self.manifest.supervisor.cascade = None;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.manifest.supervisor.workers = workers;
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.manifest.supervisor.start_timeout = timeout;
        self
    }

    pub fn declare_env(mut self, name: &str) -> Self {
        self.manifest.environment.declare.push(name.to_string());
        self
    }

    pub fn require_security_tags(mut self) -> Self {
        self.manifest.policy.require_security_tags = true;
        self
    }

    pub fn allow_security_tag(mut self, tag: &str) -> Self {
        self.manifest.policy.allowed_security_tags.push(tag.to_string());
        self
    }

    pub fn raw(self) -> RawManifest {
        self.manifest
    }

    pub fn build(self) -> Manifest {
        Manifest::try_from(self.manifest).expect("Failed to build valid manifest from builder")
    }

    pub fn build_with_env(self, env: &BTreeMap<String, String>) -> Manifest {
        validate(self.manifest, &ValidationContext::with_env(env.clone()))
            .expect("Failed to build valid manifest from builder")
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one `[[service]]` entry.
pub struct ServiceBuilder {
    service: ServiceConfig,
}

impl ServiceBuilder {
    pub fn new(id: &str, mode: ExecutionMode) -> Self {
        Self {
            service: ServiceConfig {
                id: id.to_string(),
                mode,
                command: None,
                args: vec![],
                working_dir: None,
                compose: None,
                ready_on_stdout: None,
                listen: None,
                depends_on: vec![],
                env_allowlist: vec![],
                required_env: vec![],
                env: BTreeMap::new(),
                restart: RestartConfig {
                    policy: RestartPolicyKind::OnFailure,
                    backoff_base: Duration::from_millis(10),
                    backoff_cap: Duration::from_millis(50),
                    jitter: 0.0,
                    max_retries: MaxRetries::Limited(3),
                },
                health: None,
                security_tags: vec![],
            },
        }
    }

    /// A `command` service running `program`.
    pub fn command(id: &str, program: &str) -> Self {
        Self::new(id, ExecutionMode::Command).program(program)
    }

    pub fn protocol_server(id: &str, program: &str) -> Self {
        Self::new(id, ExecutionMode::ProtocolServer).program(program)
    }

    pub fn compose(id: &str, file: impl Into<PathBuf>) -> Self {
        let mut builder = Self::new(id, ExecutionMode::Compose);
        builder.service.compose = Some(ComposeConfig {
            file: Some(file.into()),
            project: None,
            services: vec![],
        });
        builder
    }

    pub fn program(mut self, program: &str) -> Self {
        self.service.command = Some(program.to_string());
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.service.args.push(arg.to_string());
        self
    }

    pub fn ready_on_stdout(mut self, pattern: &str) -> Self {
        self.service.ready_on_stdout = Some(pattern.to_string());
        self
    }

    pub fn listen(mut self, addr: &str) -> Self {
        self.service.listen = Some(addr.to_string());
        self
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.service.depends_on.push(dep.to_string());
        self
    }

    pub fn restart(mut self, policy: RestartPolicyKind) -> Self {
        self.service.restart.policy = policy;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.service.restart.max_retries = MaxRetries::Limited(n);
        self
    }

    pub fn unbounded_retries(mut self) -> Self {
        self.service.restart.max_retries = MaxRetries::Unbounded;
        self
    }

    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.service.restart.backoff_base = base;
        self.service.restart.backoff_cap = cap;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.service.restart.jitter = jitter;
        self
    }

    /// Declare a cheap command health check probed every 20ms.
    ///
    /// With `FakeAdapter` the command never runs; probe outcomes are
    /// scripted instead.
    pub fn probed(mut self, failure_threshold: u32) -> Self {
        let mut health = HealthConfig::new(HealthCheckKind::Command);
        health.command = Some("true".to_string());
        health.interval = Duration::from_millis(20);
        health.timeout = Duration::from_millis(500);
        health.failure_threshold = failure_threshold;
        self.service.health = Some(health);
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.service.health = Some(health);
        self
    }

    pub fn env_allowlist(mut self, name: &str) -> Self {
        self.service.env_allowlist.push(name.to_string());
        self
    }

    pub fn required_env(mut self, name: &str) -> Self {
        self.service.required_env.push(name.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.service.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn security_tag(mut self, tag: &str) -> Self {
        self.service.security_tags.push(tag.to_string());
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.service
    }
}
