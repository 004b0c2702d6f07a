//! Command readiness probe.

use super::{HealthError, Probe};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Ready when the command exits with status 0.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(argv: Vec<String>, env: BTreeMap<String, String>, timeout: Duration) -> Self {
        Self { argv, env, timeout }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| HealthError::Invalid("empty readiness command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = match timeout(self.timeout, cmd.status()).await {
            Ok(status) => status?,
            Err(_) => return Err(HealthError::Timeout(self.timeout)),
        };

        if status.success() {
            Ok(())
        } else {
            Err(HealthError::CommandFailed(status.to_string()))
        }
    }

    fn describe(&self) -> String {
        format!("exec {}", self.argv.join(" "))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn probe(argv: &[&str]) -> CommandProbe {
        CommandProbe::new(
            argv.iter().map(|s| s.to_string()).collect(),
            BTreeMap::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn zero_exit_is_ready() {
        probe(&["true"]).check().await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_ready() {
        let err = probe(&["false"]).check().await.unwrap_err();
        assert!(matches!(err, HealthError::CommandFailed(_)));
    }

    #[tokio::test]
    async fn empty_command_is_invalid() {
        let err = probe(&[]).check().await.unwrap_err();
        assert!(matches!(err, HealthError::Invalid(_)));
    }
}
