//! Service declarations and lifecycle states.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Declarative description of one supervised backing service. Immutable for the run.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub backend: ServiceBackend,
    pub readiness: ReadinessCheck,
    pub depends_on: Vec<String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub restart: RestartPolicy,
    pub max_restarts: u32,
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// An externally managed service with no readiness check.
    pub fn external(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: ServiceBackend::External,
            readiness: ReadinessCheck::None,
            depends_on: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            restart: RestartPolicy::Never,
            max_restarts: 0,
            env: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_backend(mut self, backend: ServiceBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessCheck) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_timing(mut self, startup_timeout: Duration, poll_interval: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self.poll_interval = poll_interval;
        self
    }
}

/// How a service is brought up and down.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceBackend {
    /// A local process spawned from an argv.
    Process {
        command: Vec<String>,
        work_dir: Option<PathBuf>,
    },
    /// A detached `docker run` container.
    Container {
        image: String,
        ports: Vec<String>,
        args: Vec<String>,
    },
    /// A service of the configured compose stack.
    Compose { service: String },
    /// Started by someone else. Only probed.
    External,
}

impl ServiceBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceBackend::Process { .. } => "process",
            ServiceBackend::Container { .. } => "container",
            ServiceBackend::Compose { .. } => "compose",
            ServiceBackend::External => "external",
        }
    }
}

/// How to tell a service is ready.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessCheck {
    /// GET the url; `expect_status` of `None` accepts any 2xx.
    Http {
        url: String,
        expect_status: Option<u16>,
    },
    Tcp {
        host: String,
        port: u16,
    },
    /// Ready when the command exits 0.
    Command {
        command: Vec<String>,
    },
    /// Ready as soon as it is started.
    None,
}

impl fmt::Display for ReadinessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessCheck::Http { url, .. } => write!(f, "http {url}"),
            ReadinessCheck::Tcp { host, port } => write!(f, "tcp {host}:{port}"),
            ReadinessCheck::Command { command } => write!(f, "exec {}", command.join(" ")),
            ReadinessCheck::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    #[serde(alias = "none", alias = "no")]
    Never,
    OnFailure,
    Always,
}

impl RestartPolicy {
    /// Whether a degraded service should be restarted rather than failed.
    pub fn restarts(&self) -> bool {
        !matches!(self, RestartPolicy::Never)
    }

    /// Whether a service whose process exited should be brought back.
    /// `on-failure` leaves a clean exit alone.
    pub fn restarts_after_exit(&self, clean_exit: bool) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => !clean_exit,
            RestartPolicy::Always => true,
        }
    }
}

/// Lifecycle state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Pending,
    Starting,
    Healthy,
    Degraded,
    Stopped,
    Failed,
}

impl ServiceState {
    /// Reached `Starting` or beyond, so teardown must visit it.
    pub fn was_started(&self) -> bool {
        !matches!(self, ServiceState::Pending)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Degraded => write!(f, "degraded"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}
