//! Run configuration
//!
//! Loaded once from `stackrun.toml`, overridden by the environment and the
//! command line, then validated as a whole before anything is started.

mod schema;

pub use schema::{CommandLine, ConfigFile};

use crate::adapter::AdapterRegistry;
use crate::error::{Error, Result};
use crate::graph::{StartupPlan, resolve_waves};
use crate::model::{Category, Job, Runtime};
use crate::scheduler::DEFAULT_MAX_CONCURRENCY;
use crate::service::{
    DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT, ReadinessCheck, ServiceBackend, ServiceSpec,
};
use crate::supervisor::{ComposeProject, DEFAULT_GRACE_PERIOD};
use schema::{JobSection, ReadinessSection, ServiceSection, SettingsSection};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAMES: [&str; 2] = ["stackrun.toml", ".stackrun.toml"];
pub const DEFAULT_RESULTS_DIR: &str = "test-results";
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(15);

pub const ENV_CONCURRENCY: &str = "STACKRUN_CONCURRENCY";
pub const ENV_RESULTS_DIR: &str = "STACKRUN_RESULTS_DIR";

/// Run-wide settings after defaults and overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub results_dir: PathBuf,
    pub max_concurrency: usize,
    pub fail_fast: bool,
    pub skip_teardown: bool,
    pub coverage_threshold: Option<f64>,
    pub global_timeout: Option<Duration>,
    pub grace_period: Duration,
    /// `None` disables the liveness monitor.
    pub liveness_interval: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            fail_fast: false,
            skip_teardown: false,
            coverage_threshold: None,
            global_timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            liveness_interval: Some(DEFAULT_LIVENESS_INTERVAL),
        }
    }
}

/// Which jobs of the configuration to run. Empty lists select everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub runtimes: Vec<Runtime>,
    pub categories: Vec<Category>,
    pub targets: Vec<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        (self.runtimes.is_empty() || self.runtimes.contains(&job.runtime))
            && (self.categories.is_empty() || self.categories.contains(&job.category))
            && (self.targets.is_empty()
                || self
                    .targets
                    .iter()
                    .any(|t| *t == job.target || t == job.slug()))
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty() && self.categories.is_empty() && self.targets.is_empty()
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub filter: JobFilter,
    pub max_concurrency: Option<usize>,
    pub fail_fast: bool,
    pub skip_teardown: bool,
    pub coverage_threshold: Option<f64>,
    pub results_dir: Option<PathBuf>,
    pub global_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// File the configuration came from. Relative paths inside it resolve
    /// against its directory.
    pub path: PathBuf,
    pub settings: Settings,
    pub compose: ComposeProject,
    pub env: BTreeMap<String, String>,
    pub services: Vec<ServiceSpec>,
    pub jobs: Vec<Job>,
}

/// Search `start` and its ancestors for a configuration file.
pub fn discover(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// The explicit path if given, otherwise the first file found upward from
/// the current directory.
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::ConfigNotFound(path.display().to_string()));
    }
    let cwd = std::env::current_dir()?;
    discover(&cwd).ok_or_else(|| Error::ConfigNotFound(CONFIG_FILE_NAMES.join(" or ")))
}

impl StackConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid_config(path, format!("cannot read file: {e}")))?;
        Self::parse(&content, path)
    }

    /// Parse `content` as if it were read from `path`.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::invalid_config(path, e.to_string()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let invalid = |reason: String| Error::invalid_config(path, reason);

        let settings = resolve_settings(&file.settings, &base);
        let startup_timeout = file
            .settings
            .startup_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STARTUP_TIMEOUT);
        let poll_interval = file
            .settings
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        let compose = match &file.compose {
            Some(section) => ComposeProject {
                file: section.file.as_ref().map(|f| base.join(f)),
                project: section.project.clone(),
            },
            None => ComposeProject::default(),
        };

        let mut services = Vec::with_capacity(file.services.len());
        for (name, section) in &file.services {
            let spec = service_spec(name, section, &base, startup_timeout, poll_interval)
                .map_err(|reason| invalid(format!("service '{name}': {reason}")))?;
            services.push(spec);
        }

        let mut jobs = Vec::with_capacity(file.jobs.len());
        for (index, section) in file.jobs.iter().enumerate() {
            let job = job_from_section(section, &base)
                .map_err(|reason| invalid(format!("job #{}: {reason}", index + 1)))?;
            jobs.push(job);
        }

        Ok(Self {
            path: path.to_path_buf(),
            settings,
            compose,
            env: file.env,
            services,
            jobs,
        })
    }

    /// Apply `STACKRUN_*` variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CONCURRENCY) {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                Error::invalid_config(
                    &self.path,
                    format!("{ENV_CONCURRENCY}='{value}' is not a positive integer"),
                )
            })?;
            self.settings.max_concurrency = parsed;
        }
        if let Some(value) = lookup(ENV_RESULTS_DIR)
            && !value.trim().is_empty()
        {
            self.settings.results_dir = PathBuf::from(value);
        }
        Ok(())
    }

    /// Apply command-line overrides and keep only the selected jobs.
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        let settings = &mut self.settings;
        if let Some(n) = overrides.max_concurrency {
            settings.max_concurrency = n;
        }
        settings.fail_fast |= overrides.fail_fast;
        settings.skip_teardown |= overrides.skip_teardown;
        if overrides.coverage_threshold.is_some() {
            settings.coverage_threshold = overrides.coverage_threshold;
        }
        if let Some(dir) = &overrides.results_dir {
            settings.results_dir = dir.clone();
        }
        if overrides.global_timeout.is_some() {
            settings.global_timeout = overrides.global_timeout;
        }
        if !overrides.filter.is_empty() {
            self.jobs.retain(|job| overrides.filter.matches(job));
        }
    }

    /// Check the whole configuration. Returns the startup plan on success.
    pub fn validate(&self, registry: &AdapterRegistry) -> Result<StartupPlan> {
        let invalid = |reason: String| Error::invalid_config(&self.path, reason);

        if self.settings.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1".to_string()));
        }
        if let Some(threshold) = self.settings.coverage_threshold
            && !(0.0..=100.0).contains(&threshold)
        {
            return Err(invalid(format!(
                "coverage_threshold {threshold} is outside 0..=100"
            )));
        }

        let plan = resolve_waves(&self.services)?;

        let known: HashSet<&str> = self.services.iter().map(|s| s.name.as_str()).collect();
        let mut ids = HashSet::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if !ids.insert(job.id.as_str()) {
                return Err(Error::DuplicateJob(job.id.clone()));
            }
            if let Some(missing) = job.requires.iter().find(|r| !known.contains(r.as_str())) {
                return Err(Error::UnknownService {
                    referrer: format!("job '{}'", job.id),
                    reference: missing.clone(),
                });
            }
            if !registry.contains(job.runtime) {
                return Err(Error::UnknownAdapter {
                    runtime: job.runtime.to_string(),
                    job: job.id.clone(),
                });
            }
        }

        let compose_services: Vec<&str> = self
            .services
            .iter()
            .filter_map(|s| match &s.backend {
                ServiceBackend::Compose { service } => Some(service.as_str()),
                _ => None,
            })
            .collect();
        self.compose.validate(&compose_services)?;

        Ok(plan)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}

fn resolve_settings(section: &SettingsSection, base: &Path) -> Settings {
    let defaults = Settings::default();
    Settings {
        results_dir: section
            .results_dir
            .as_ref()
            .map(|dir| base.join(dir))
            .unwrap_or_else(|| base.join(DEFAULT_RESULTS_DIR)),
        max_concurrency: section.max_concurrency.unwrap_or(defaults.max_concurrency),
        fail_fast: section.fail_fast,
        skip_teardown: section.skip_teardown,
        coverage_threshold: section.coverage_threshold,
        global_timeout: section
            .global_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        grace_period: section
            .grace_period_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.grace_period),
        liveness_interval: match section.liveness_interval_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.liveness_interval,
        },
    }
}

fn service_spec(
    name: &str,
    section: &ServiceSection,
    base: &Path,
    startup_timeout: Duration,
    poll_interval: Duration,
) -> std::result::Result<ServiceSpec, String> {
    if name.trim().is_empty() {
        return Err("service name is empty".to_string());
    }

    let backend = match (&section.command, &section.image, &section.compose_service) {
        (Some(command), None, None) => ServiceBackend::Process {
            command: command.to_argv()?,
            work_dir: section.work_dir.as_ref().map(|dir| base.join(dir)),
        },
        (None, Some(image), None) => ServiceBackend::Container {
            image: image.clone(),
            ports: section.ports.clone(),
            args: section.args.clone(),
        },
        (None, None, Some(service)) => ServiceBackend::Compose {
            service: service.clone(),
        },
        (None, None, None) => ServiceBackend::External,
        _ => return Err("set at most one of command, image or compose_service".to_string()),
    };

    let readiness = match &section.readiness {
        Some(readiness) => readiness_check(readiness)?,
        None => ReadinessCheck::None,
    };

    Ok(ServiceSpec {
        name: name.to_string(),
        backend,
        readiness,
        depends_on: section.depends_on.clone(),
        startup_timeout: section
            .startup_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(startup_timeout),
        poll_interval: section
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(poll_interval),
        restart: section.restart,
        max_restarts: section.max_restarts.unwrap_or(if section.restart.restarts() {
            3
        } else {
            0
        }),
        env: section.env.clone(),
    })
}

fn readiness_check(section: &ReadinessSection) -> std::result::Result<ReadinessCheck, String> {
    match (&section.http, &section.tcp, &section.command) {
        (Some(url), None, None) => Ok(ReadinessCheck::Http {
            url: url.clone(),
            expect_status: section.expect_status,
        }),
        (None, Some(address), None) => {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| format!("tcp readiness '{address}' must be host:port"))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("tcp readiness '{address}' has an invalid port"))?;
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            Ok(ReadinessCheck::Tcp {
                host: host.to_string(),
                port,
            })
        }
        (None, None, Some(command)) => Ok(ReadinessCheck::Command {
            command: command.to_argv()?,
        }),
        (None, None, None) => Ok(ReadinessCheck::None),
        _ => Err("readiness takes exactly one of http, tcp or command".to_string()),
    }
}

fn job_from_section(section: &JobSection, base: &Path) -> std::result::Result<Job, String> {
    let runtime: Runtime = section.runtime.parse()?;
    let category: Category = section.category.parse()?;
    let target = section.target.trim();
    if target.is_empty() {
        return Err("target is empty".to_string());
    }

    let slug = slugify(section.name.as_deref().unwrap_or(target));
    if slug.is_empty() {
        return Err(format!("cannot derive a job name from '{target}'"));
    }

    let mut job = Job::new(runtime, category, target).with_slug(&slug);
    job.work_dir = match &section.work_dir {
        Some(dir) => base.join(dir),
        None => base.to_path_buf(),
    };
    if let Some(command) = &section.command {
        job.command = Some(command.to_argv()?);
    }
    job.env = section.env.clone();
    job.requires = section.requires.clone();
    job.timeout = section
        .timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    job.retries = section.retries;
    if let Some(coverage) = section.coverage {
        job.collect_coverage = coverage && category.collects_coverage();
    }
    Ok(job)
}

/// File-system safe form of a target: `./services/api` becomes `services-api`.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
