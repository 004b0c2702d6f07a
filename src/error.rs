//! Error Types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for runs where every job passed (or was skipped).
pub const EXIT_OK: i32 = 0;
/// Exit code for test failures, launch errors, cancellation or missed coverage.
pub const EXIT_FAILED: i32 = 1;
/// Exit code for configuration and dependency-graph errors. Nothing was started.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for infrastructure that never became healthy. No job ran.
pub const EXIT_INFRA: i32 = 3;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration in {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("Configuration file not found (looked for {0})")]
    ConfigNotFound(String),

    #[error("Duplicate service: {0}")]
    DuplicateService(String),

    #[error("Unknown service '{reference}' referenced by {referrer}")]
    UnknownService { referrer: String, reference: String },

    #[error("Dependency cycle detected: {cycle}")]
    DependencyCycle { cycle: String },

    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    #[error("No adapter registered for runtime '{runtime}' (job {job})")]
    UnknownAdapter { runtime: String, job: String },

    #[error("Service start failed: {service} - {reason}")]
    ServiceStart { service: String, reason: String },

    #[error("Service unhealthy: {service} did not become ready within {timeout:?}")]
    ServiceUnhealthy { service: String, timeout: Duration },

    #[error("Service stop failed: {service} - {reason}")]
    ServiceStop { service: String, reason: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Job launch failed: {job} - {reason}")]
    JobLaunch { job: String, reason: String },

    #[error("Compose command failed: {reason}")]
    Compose { reason: String },

    #[error("Failed to write report {path}: {reason}")]
    Report { path: PathBuf, reason: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn invalid_config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that are detected before anything starts.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::ConfigNotFound(_)
                | Error::DuplicateService(_)
                | Error::UnknownService { .. }
                | Error::DependencyCycle { .. }
                | Error::DuplicateJob(_)
                | Error::UnknownAdapter { .. }
        )
    }

    /// Errors raised while bringing infrastructure up.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::ServiceStart { .. }
                | Error::ServiceUnhealthy { .. }
                | Error::Compose { .. }
        )
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_config() {
            EXIT_CONFIG
        } else if self.is_infrastructure() {
            EXIT_INFRA
        } else {
            EXIT_FAILED
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidConfig { .. } => "invalid_config",
            Error::ConfigNotFound(_) => "config_not_found",
            Error::DuplicateService(_) => "duplicate_service",
            Error::UnknownService { .. } => "unknown_service",
            Error::DependencyCycle { .. } => "dependency_cycle",
            Error::DuplicateJob(_) => "duplicate_job",
            Error::UnknownAdapter { .. } => "unknown_adapter",
            Error::ServiceStart { .. } => "service_start",
            Error::ServiceUnhealthy { .. } => "service_unhealthy",
            Error::ServiceStop { .. } => "service_stop",
            Error::ServiceNotFound(_) => "service_not_found",
            Error::Probe(_) => "probe",
            Error::JobLaunch { .. } => "job_launch",
            Error::Compose { .. } => "compose",
            Error::Report { .. } => "report",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "other",
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        match self {
            Error::ServiceStart { service, .. }
            | Error::ServiceUnhealthy { service, .. }
            | Error::ServiceStop { service, .. } => Some(service),
            Error::ServiceNotFound(name) | Error::DuplicateService(name) => Some(name),
            Error::UnknownService { reference, .. } => Some(reference),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_exit_with_two() {
        let err = Error::DependencyCycle {
            cycle: "a -> b -> a".to_string(),
        };
        assert!(err.is_config());
        assert_eq!(err.exit_code(), EXIT_CONFIG);
        assert_eq!(err.kind(), "dependency_cycle");
    }

    #[test]
    fn infrastructure_errors_exit_with_three() {
        let err = Error::ServiceUnhealthy {
            service: "db".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_infrastructure());
        assert_eq!(err.exit_code(), EXIT_INFRA);
        assert_eq!(err.service_name(), Some("db"));
    }

    #[test]
    fn other_errors_exit_with_one() {
        assert_eq!(Error::other("boom").exit_code(), EXIT_FAILED);
        assert_eq!(Error::Cancelled.exit_code(), EXIT_FAILED);
    }
}
