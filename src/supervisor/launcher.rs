//! How a service is brought up and down.

use super::compose::{ComposeLauncher, ComposeProject};
use super::container::ContainerLauncher;
use super::process::ProcessLauncher;
use crate::error::Result;
use crate::service::{ServiceBackend, ServiceSpec};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Launcher: Send {
    /// Bring the service up. Readiness is checked separately.
    async fn launch(&mut self) -> Result<()>;

    /// Graceful stop within `grace`, then forced.
    async fn shutdown(&mut self, grace: Duration) -> Result<()>;

    /// `Some(clean_exit)` once the service is known to have exited on its own.
    fn exited(&mut self) -> Option<bool> {
        None
    }

    /// Remove leftovers of an earlier run that this process never started.
    async fn cleanup_stale(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Inputs shared by every launcher of a run.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    /// Where process services write their stdout and stderr.
    pub log_dir: Option<PathBuf>,
    pub compose: Arc<ComposeProject>,
}

/// Services someone else runs. Nothing to launch or stop.
pub struct ExternalLauncher;

#[async_trait]
impl Launcher for ExternalLauncher {
    async fn launch(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<()> {
        Ok(())
    }
}

pub fn launcher_for(spec: &ServiceSpec, ctx: &LaunchContext) -> Box<dyn Launcher> {
    match &spec.backend {
        ServiceBackend::Process { command, work_dir } => Box::new(ProcessLauncher::new(
            &spec.name,
            command.clone(),
            work_dir.clone(),
            spec.env.clone(),
            ctx.log_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}.log", spec.name))),
        )),
        ServiceBackend::Container { image, ports, args } => Box::new(ContainerLauncher::new(
            &spec.name,
            image.clone(),
            ports.clone(),
            args.clone(),
            spec.env.clone(),
        )),
        ServiceBackend::Compose { service } => Box::new(ComposeLauncher::new(
            Arc::clone(&ctx.compose),
            service.clone(),
        )),
        ServiceBackend::External => Box::new(ExternalLauncher),
    }
}
