//! Locally spawned service processes.

use super::launcher::Launcher;
use crate::error::{Error, Result};
use crate::process::GroupChild;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub struct ProcessLauncher {
    name: String,
    command: Vec<String>,
    work_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    log_path: Option<PathBuf>,
    child: Option<GroupChild>,
}

impl ProcessLauncher {
    pub fn new(
        name: &str,
        command: Vec<String>,
        work_dir: Option<PathBuf>,
        env: BTreeMap<String, String>,
        log_path: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.to_string(),
            command,
            work_dir,
            env,
            log_path,
            child: None,
        }
    }

    fn start_error(&self, reason: impl Into<String>) -> Error {
        Error::ServiceStart {
            service: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn output(&self) -> Result<(Stdio, Stdio)> {
        let Some(path) = &self.log_path else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let stderr = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&mut self) -> Result<()> {
        if let Some(child) = self.child.as_mut()
            && matches!(child.try_wait(), Ok(None))
        {
            debug!(service = %self.name, "process already running");
            return Ok(());
        }
        if let Some(previous) = self.child.take()
            && let Err(err) = previous.kill_group()
        {
            debug!(service = %self.name, error = %err, "could not clear previous process group");
        }

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| self.start_error("empty command"))?;

        let (stdout, stderr) = self
            .output()
            .map_err(|err| self.start_error(format!("cannot open service log: {err}")))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        let child = GroupChild::spawn(&mut cmd)
            .map_err(|err| self.start_error(format!("failed to spawn '{program}': {err}")))?;
        info!(service = %self.name, pid = ?child.id(), "service process spawned");
        self.child = Some(child);
        Ok(())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let stop_error = |err: std::io::Error| Error::ServiceStop {
            service: self.name.clone(),
            reason: err.to_string(),
        };
        let status = child.terminate(grace).await.map_err(stop_error)?;
        debug!(service = %self.name, %status, "service process exited");
        child.reap_group(grace).await.map_err(stop_error)

    }

    fn exited(&mut self) -> Option<bool> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.success()),
            _ => None,
        }
    }
}
