//! Docker Container Backend
//!
//! Detached `docker run` containers, stopped with `docker stop` and removed.

use super::launcher::Launcher;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub struct ContainerLauncher {
    name: String,
    image: String,
    ports: Vec<String>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    container_id: Option<String>,
}

impl ContainerLauncher {
    pub fn new(
        name: &str,
        image: String,
        ports: Vec<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            image,
            ports,
            args,
            env,
            container_id: None,
        }
    }

    pub fn container_name(&self) -> String {
        format!("stackrun-{}", self.name)
    }

    /// Arguments passed to `docker` to start the container.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(),
        ];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mapping in &self.ports {
            args.push("-p".to_string());
            args.push(mapping.clone());
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }

    async fn remove(&self, target: &str) {
        let _ = Command::new("docker")
            .args(["rm", "-f", target])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    async fn launch(&mut self) -> Result<()> {
        if self.container_id.is_some() {
            return Ok(());
        }

        // A container left over from an interrupted run would block the name.
        self.remove(&self.container_name()).await;

        let output = Command::new("docker")
            .args(self.run_args())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::ServiceStart {
                service: self.name.clone(),
                reason: format!("failed to run docker: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ServiceStart {
                service: self.name.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(service = %self.name, container = %container_id, image = %self.image, "container started");
        self.container_id = Some(container_id);
        Ok(())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        let Some(container_id) = self.container_id.take() else {
            return Ok(());
        };

        let status = Command::new("docker")
            .args(["stop", "-t", &grace.as_secs().max(1).to_string(), &container_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        debug!(service = %self.name, container = %container_id, ?status, "docker stop finished");

        self.remove(&container_id).await;
        Ok(())
    }

    async fn cleanup_stale(&mut self) -> Result<()> {
        self.remove(&self.container_name()).await;
        Ok(())
    }
}
