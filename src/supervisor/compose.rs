//! Docker Compose Backend
//!
//! Services that live in a compose file are started one by one with
//! `docker compose up -d <service>`; the whole project goes down at teardown.

use super::launcher::Launcher;
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Subset of a compose file needed to validate references.
#[derive(Debug, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: IndexMap<String, ComposeService>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposeService {
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Vec<serde_yaml::Value>,
}

impl ComposeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid_config(path, format!("cannot read compose file: {e}")))?;
        Self::parse(&content).map_err(|reason| Error::invalid_config(path, reason))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        serde_yaml::from_str(content).map_err(|e| format!("invalid compose file: {e}"))
    }
}

/// The compose project the run talks to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeProject {
    pub file: Option<PathBuf>,
    pub project: Option<String>,
}

impl ComposeProject {
    /// Leading `docker` arguments selecting the file and project.
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        if let Some(file) = &self.file {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        if let Some(project) = &self.project {
            args.push("-p".to_string());
            args.push(project.clone());
        }
        args
    }

    /// Check that every referenced service exists in the compose file.
    pub fn validate(&self, services: &[&str]) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let compose = ComposeFile::load(path)?;
        for service in services {
            if !compose.services.contains_key(*service) {
                return Err(Error::invalid_config(
                    path,
                    format!("compose service '{service}' is not defined"),
                ));
            }
        }
        Ok(())
    }

    async fn docker(&self, extra: &[&str]) -> Result<()> {
        let mut args = self.base_args();
        args.extend(extra.iter().map(|s| s.to_string()));
        debug!(args = ?args, "docker compose");

        let output = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Compose {
                reason: format!("failed to run docker compose: {e}"),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Compose {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    pub async fn up(&self, service: &str) -> Result<()> {
        self.docker(&["up", "-d", service]).await
    }

    pub async fn stop(&self, service: &str, grace: Duration) -> Result<()> {
        let timeout = grace.as_secs().max(1).to_string();
        self.docker(&["stop", "-t", &timeout, service]).await
    }

    pub async fn down(&self) -> Result<()> {
        info!(project = ?self.project, "bringing compose project down");
        self.docker(&["down", "--remove-orphans"]).await
    }
}

pub struct ComposeLauncher {
    project: Arc<ComposeProject>,
    service: String,
    up: bool,
}

impl ComposeLauncher {
    pub fn new(project: Arc<ComposeProject>, service: String) -> Self {
        Self {
            project,
            service,
            up: false,
        }
    }
}

#[async_trait]
impl Launcher for ComposeLauncher {
    async fn launch(&mut self) -> Result<()> {
        self.project.up(&self.service).await?;
        self.up = true;
        Ok(())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        if !self.up {
            return Ok(());
        }
        self.up = false;
        self.project.stop(&self.service, grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_select_file_and_project() {
        let project = ComposeProject {
            file: Some(PathBuf::from("deploy/compose.yml")),
            project: Some("ci".to_string()),
        };
        assert_eq!(
            project.base_args(),
            vec!["compose", "-f", "deploy/compose.yml", "-p", "ci"]
        );
        assert_eq!(ComposeProject::default().base_args(), vec!["compose"]);
    }

    #[test]
    fn parses_services_in_declaration_order() {
        let compose = ComposeFile::parse(
            r#"
services:
  postgres:
    image: postgres:15
    ports: ["5432:5432"]
  redis:
    image: redis:7
"#,
        )
        .unwrap();
        let names: Vec<_> = compose.services.keys().cloned().collect();
        assert_eq!(names, vec!["postgres", "redis"]);
        assert_eq!(compose.services["postgres"].ports.len(), 1);
    }

    #[test]
    fn validate_rejects_unknown_compose_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compose.yml");
        std::fs::write(&path, "services:\n  db:\n    image: postgres\n").unwrap();
        let project = ComposeProject {
            file: Some(path),
            project: None,
        };
        project.validate(&["db"]).unwrap();
        let err = project.validate(&["queue"]).unwrap_err();
        assert!(err.is_config());
    }
}
