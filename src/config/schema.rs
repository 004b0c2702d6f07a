//! On-disk layout of `stackrun.toml`.

use crate::service::RestartPolicy;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub settings: SettingsSection,
    pub compose: Option<ComposeSection>,
    /// Variables passed to every job.
    pub env: BTreeMap<String, String>,
    /// Kept in declaration order so startup waves list services as written.
    pub services: IndexMap<String, ServiceSection>,
    pub jobs: Vec<JobSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsSection {
    pub results_dir: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
    pub fail_fast: bool,
    pub skip_teardown: bool,
    pub coverage_threshold: Option<f64>,
    pub global_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub startup_timeout_secs: Option<u64>,
    /// Zero disables the liveness monitor.
    pub liveness_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComposeSection {
    pub file: Option<PathBuf>,
    pub project: Option<String>,
}

/// Either a shell-style string or an explicit argv.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn to_argv(&self) -> Result<Vec<String>, String> {
        let argv = match self {
            CommandLine::Shell(line) => {
                shell_words::split(line).map_err(|e| format!("cannot split '{line}': {e}"))?
            }
            CommandLine::Argv(argv) => argv.clone(),
        };
        if argv.is_empty() {
            return Err("command is empty".to_string());
        }
        Ok(argv)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    pub command: Option<CommandLine>,
    pub work_dir: Option<PathBuf>,
    pub image: Option<String>,
    pub args: Vec<String>,
    pub ports: Vec<String>,
    pub compose_service: Option<String>,
    pub readiness: Option<ReadinessSection>,
    pub depends_on: Vec<String>,
    pub startup_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub restart: RestartPolicy,
    pub max_restarts: Option<u32>,
    pub env: BTreeMap<String, String>,
}

/// Exactly one of `http`, `tcp` or `command`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSection {
    pub http: Option<String>,
    pub expect_status: Option<u16>,
    /// `host:port`
    pub tcp: Option<String>,
    pub command: Option<CommandLine>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSection {
    /// Overrides the id's last segment, which defaults to the target.
    pub name: Option<String>,
    pub runtime: String,
    pub category: String,
    pub target: String,
    pub work_dir: Option<PathBuf>,
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub requires: Vec<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    pub coverage: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_lines_split_like_a_shell() {
        let line = CommandLine::Shell("go test -run 'TestA|TestB' ./...".into());
        assert_eq!(
            line.to_argv().unwrap(),
            vec!["go", "test", "-run", "TestA|TestB", "./..."]
        );
        assert!(CommandLine::Shell("   ".into()).to_argv().is_err());
        assert!(CommandLine::Shell("echo 'open".into()).to_argv().is_err());
        assert_eq!(
            CommandLine::Argv(vec!["a b".into()]).to_argv().unwrap(),
            vec!["a b"]
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<ConfigFile>("[settings]\nmax_concurency = 2\n").unwrap_err();
        assert!(err.to_string().contains("max_concurency"));
    }
}
