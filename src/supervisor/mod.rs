//! Service Supervisor
//!
//! Owns the lifecycle of every backing service for one run:
//!
//! ```text
//! Pending -> Starting -> Healthy | Failed
//! Healthy -> Degraded -> Healthy | Failed   (restart policy decides)
//! ```
//!
//! Waves from the startup plan start concurrently. A failure in any wave
//! aborts the rest and stops what was started in reverse dependency order.

mod compose;
mod container;
mod launcher;
mod process;

pub use compose::{ComposeFile, ComposeProject};
pub use launcher::{ExternalLauncher, LaunchContext, Launcher, launcher_for};

use crate::error::{Error, Result};
use crate::graph::StartupPlan;
use crate::health::{self, MIN_ATTEMPT_TIMEOUT, ProbeOutcome};
use crate::service::{ServiceBackend, ServiceSpec, ServiceState};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub grace_period: Duration,
    pub launch: LaunchContext,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            launch: LaunchContext::default(),
        }
    }
}

struct ManagedService {
    spec: ServiceSpec,
    state: ServiceState,
    restarts: u32,
}

pub struct Supervisor {
    order: Vec<String>,
    services: Mutex<HashMap<String, ManagedService>>,
    launchers: HashMap<String, AsyncMutex<Box<dyn Launcher>>>,
    compose: Arc<ComposeProject>,
    /// Set once a compose service has been launched, cleared by `down`.
    compose_up: AtomicBool,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(specs: Vec<ServiceSpec>, options: SupervisorOptions) -> Self {
        let ctx = options.launch.clone();
        Self::with_launchers(specs, options, |spec| launcher_for(spec, &ctx))
    }

    /// Build with a custom launcher per service.
    pub fn with_launchers<F>(specs: Vec<ServiceSpec>, options: SupervisorOptions, make: F) -> Self
    where
        F: Fn(&ServiceSpec) -> Box<dyn Launcher>,
    {
        let mut order = Vec::with_capacity(specs.len());
        let mut services = HashMap::with_capacity(specs.len());
        let mut launchers = HashMap::with_capacity(specs.len());

        for spec in specs {
            order.push(spec.name.clone());
            launchers.insert(spec.name.clone(), AsyncMutex::new(make(&spec)));
            services.insert(
                spec.name.clone(),
                ManagedService {
                    spec,
                    state: ServiceState::Pending,
                    restarts: 0,
                },
            );
        }

        Self {
            order,
            services: Mutex::new(services),
            launchers,
            compose: options.launch.compose,
            compose_up: AtomicBool::new(false),
            grace_period: options.grace_period,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, ManagedService>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launcher(&self, name: &str) -> Result<&AsyncMutex<Box<dyn Launcher>>> {
        self.launchers
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    fn set_state(&self, name: &str, state: ServiceState) {
        if let Some(service) = self.table().get_mut(name) {
            if service.state != state {
                debug!(service = %name, from = %service.state, to = %state, "service state");
            }
            service.state = state;
        }
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.table().get(name).map(|s| s.state)
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.state(name) == Some(ServiceState::Healthy)
    }

    /// Every service and its state, in declaration order.
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        let table = self.table();
        self.order
            .iter()
            .filter_map(|name| table.get(name).map(|s| (name.clone(), s.state)))
            .collect()
    }

    pub fn restarts(&self, name: &str) -> u32 {
        self.table().get(name).map_or(0, |s| s.restarts)
    }

    /// Launch `name` and wait for it to become ready. A service that is
    /// already Healthy is left alone. The launcher stays locked until the
    /// probe settles, so concurrent starts of one service launch it once.
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let mut launcher = self.launcher(name)?.lock().await;

        let spec = {
            let table = self.table();
            let service = table
                .get(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            if service.state == ServiceState::Healthy {
                debug!(service = %name, "already healthy");
                return Ok(());
            }
            service.spec.clone()
        };

        self.set_state(name, ServiceState::Starting);
        if matches!(spec.backend, ServiceBackend::Compose { .. }) {
            self.compose_up.store(true, Ordering::SeqCst);
        }
        info!(service = %name, backend = spec.backend.kind(), readiness = %spec.readiness, "starting service");

        if let Err(err) = launcher.launch().await {
            error!(service = %name, error = %err, "service failed to launch");
            self.set_state(name, ServiceState::Failed);
            return Err(err);
        }

        match health::probe(&spec, spec.startup_timeout, spec.poll_interval, cancel).await {
            ProbeOutcome::Healthy { attempts, elapsed } => {
                self.set_state(name, ServiceState::Healthy);
                info!(service = %name, attempts, elapsed_ms = elapsed.as_millis() as u64, "service healthy");
                Ok(())
            }
            ProbeOutcome::TimedOut {
                attempts,
                last_error,
            } => {
                self.set_state(name, ServiceState::Failed);
                error!(
                    service = %name,
                    attempts,
                    last_error = last_error.as_deref().unwrap_or("none"),
                    "service never became healthy"
                );
                Err(Error::ServiceUnhealthy {
                    service: name.to_string(),
                    timeout: spec.startup_timeout,
                })
            }
            ProbeOutcome::Cancelled => {
                self.set_state(name, ServiceState::Failed);
                Err(Error::Cancelled)
            }
        }
    }

    /// Graceful stop. Services that never started are skipped. A Failed
    /// service keeps its state so the failure stays visible.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut launcher = self.launcher(name)?.lock().await;

        let state = self
            .state(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        if !state.was_started() || state == ServiceState::Stopped {
            return Ok(());
        }

        info!(service = %name, grace_ms = self.grace_period.as_millis() as u64, "stopping service");
        let result = launcher.shutdown(self.grace_period).await;
        if state != ServiceState::Failed {
            self.set_state(name, ServiceState::Stopped);
        }
        result
    }

    pub async fn restart(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.stop(name).await?;
        let attempt = {
            let mut table = self.table();
            let service = table
                .get_mut(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            service.restarts += 1;
            service.state = ServiceState::Pending;
            service.restarts
        };
        warn!(service = %name, attempt, "restarting service");
        self.start(name, cancel).await
    }

    /// Start every member of a wave concurrently. The first failure cancels
    /// the siblings still starting and is returned once all have settled.
    pub async fn start_wave(&self, wave: &[String], cancel: &CancellationToken) -> Result<()> {
        let wave_cancel = cancel.child_token();
        let mut pending: FuturesUnordered<_> = wave
            .iter()
            .map(|name| {
                let token = wave_cancel.clone();
                async move { (name, self.start(name, &token).await) }
            })
            .collect();

        let mut first_error = None;
        while let Some((name, result)) = pending.next().await {
            if let Err(err) = result {
                if first_error.is_none() {
                    warn!(service = %name, error = %err, "aborting wave");
                    wave_cancel.cancel();
                    first_error = Some(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Bring the whole plan up. On failure everything started so far is torn
    /// down before the error is returned.
    pub async fn start_all(&self, plan: &StartupPlan, cancel: &CancellationToken) -> Result<()> {
        for (index, wave) in plan.waves.iter().enumerate() {
            if cancel.is_cancelled() {
                self.teardown(plan).await;
                return Err(Error::Cancelled);
            }
            info!(wave = index, services = ?wave, "starting wave");
            if let Err(err) = self.start_wave(wave, cancel).await {
                self.teardown(plan).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stop every started service in reverse dependency order. Keeps going
    /// past individual failures and returns them.
    pub async fn teardown(&self, plan: &StartupPlan) -> Vec<Error> {
        let mut errors = Vec::new();
        for name in plan.teardown_order() {
            if let Err(err) = self.stop(&name).await {
                warn!(service = %name, error = %err, "stop failed");
                errors.push(err);
            }
        }

        if self.compose_up.swap(false, Ordering::SeqCst)
            && let Err(err) = self.compose.down().await
        {
            warn!(error = %err, "compose down failed");
            errors.push(err);
        }
        errors
    }

    /// Remove containers and compose stacks left behind by an earlier run.
    pub async fn cleanup_stale(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        for name in self.order.iter().rev() {
            let Ok(launcher) = self.launcher(name) else {
                continue;
            };
            if let Err(err) = launcher.lock().await.cleanup_stale().await {
                errors.push(err);
            }
        }

        let uses_compose = self
            .table()
            .values()
            .any(|s| matches!(s.spec.backend, ServiceBackend::Compose { .. }));
        if uses_compose && let Err(err) = self.compose.down().await {
            errors.push(err);
        }
        errors
    }

    /// One liveness pass over Healthy and Degraded services.
    pub async fn check_liveness(&self, cancel: &CancellationToken) {
        for name in &self.order {
            if cancel.is_cancelled() {
                return;
            }

            let (spec, state, restarts) = {
                let table = self.table();
                let Some(service) = table.get(name) else {
                    continue;
                };
                (service.spec.clone(), service.state, service.restarts)
            };
            if !matches!(state, ServiceState::Healthy | ServiceState::Degraded) {
                continue;
            }

            let exited = match self.launcher(name) {
                Ok(launcher) => launcher.lock().await.exited(),
                Err(_) => None,
            };
            let alive = match exited {
                Some(_) => false,
                None => {
                    let attempt = spec.poll_interval.max(MIN_ATTEMPT_TIMEOUT);
                    health::check_once(&spec, attempt).await.is_ok()
                }
            };

            if alive {
                if state == ServiceState::Degraded {
                    info!(service = %name, "service recovered");
                    self.set_state(name, ServiceState::Healthy);
                }
                continue;
            }

            if state == ServiceState::Healthy {
                warn!(service = %name, exited = exited.is_some(), "service degraded");
                self.set_state(name, ServiceState::Degraded);
            }

            let wants_restart = match exited {
                Some(clean) => spec.restart.restarts_after_exit(clean),
                None => spec.restart.restarts(),
            };

            if wants_restart && restarts < spec.max_restarts {
                if let Err(err) = self.restart(name, cancel).await {
                    error!(service = %name, error = %err, "restart failed");
                    self.set_state(name, ServiceState::Failed);
                }
            } else if wants_restart || exited.is_some() || state == ServiceState::Degraded {
                error!(service = %name, restarts, "service failed");
                self.set_state(name, ServiceState::Failed);
            }
        }
    }

    /// Re-probe services every `interval` until `cancel` fires.
    pub fn spawn_liveness(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => supervisor.check_liveness(&cancel).await,
                }
            }
            debug!("liveness monitor stopped");
        })
    }
}
