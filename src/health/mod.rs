//! Health Prober
//!
//! Polls a readiness check until it succeeds or a deadline passes. Probing is
//! read-only: a probe never starts, stops or mutates the service it checks.

mod command;
mod http;
mod tcp;

pub use command::CommandProbe;
pub use http::HttpProbe;
pub use tcp::TcpProbe;

use crate::service::{ReadinessCheck, ServiceSpec};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Lower bound for a single check attempt.
pub const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    UnexpectedStatus(u16),

    #[error("command exited with {0}")]
    CommandFailed(String),

    #[error("invalid probe: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// Run the check once.
    async fn check(&self) -> Result<(), HealthError>;

    fn describe(&self) -> String;
}

/// Result of polling a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy {
        attempts: u32,
        elapsed: Duration,
    },
    TimedOut {
        attempts: u32,
        last_error: Option<String>,
    },
    Cancelled,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }
}

struct AlwaysReady;

#[async_trait]
impl Probe for AlwaysReady {
    async fn check(&self) -> Result<(), HealthError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

/// Build the probe for a readiness check.
pub fn create_probe(
    check: &ReadinessCheck,
    env: &BTreeMap<String, String>,
    attempt_timeout: Duration,
) -> Box<dyn Probe> {
    match check {
        ReadinessCheck::Http { url, expect_status } => Box::new(HttpProbe::new(
            url.clone(),
            *expect_status,
            attempt_timeout,
        )),
        ReadinessCheck::Tcp { host, port } => {
            Box::new(TcpProbe::new(host.clone(), *port, attempt_timeout))
        }
        ReadinessCheck::Command { command } => Box::new(CommandProbe::new(
            command.clone(),
            env.clone(),
            attempt_timeout,
        )),
        ReadinessCheck::None => Box::new(AlwaysReady),
    }
}

/// Poll `spec`'s readiness check every `poll_interval` until it passes or
/// `timeout` elapses. Returns on the first success.
pub async fn probe(
    spec: &ServiceSpec,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let attempt_timeout = poll_interval.max(MIN_ATTEMPT_TIMEOUT);
    let checker = create_probe(&spec.readiness, &spec.env, attempt_timeout);
    poll_until_ready(checker.as_ref(), timeout, poll_interval, cancel).await
}

/// Single-shot liveness check, bounded by `attempt_timeout`.
pub async fn check_once(spec: &ServiceSpec, attempt_timeout: Duration) -> Result<(), HealthError> {
    let checker = create_probe(&spec.readiness, &spec.env, attempt_timeout);
    match tokio::time::timeout(attempt_timeout, checker.check()).await {
        Ok(result) => result,
        Err(_) => Err(HealthError::Timeout(attempt_timeout)),
    }
}

pub async fn poll_until_ready(
    checker: &dyn Probe,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> ProbeOutcome {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        if cancel.is_cancelled() {
            return ProbeOutcome::Cancelled;
        }

        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = remaining.max(MIN_ATTEMPT_TIMEOUT);
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            result = tokio::time::timeout(budget, checker.check()) => result,
        };

        match attempt {
            Ok(Ok(())) => {
                debug!(probe = %checker.describe(), attempts, "probe succeeded");
                return ProbeOutcome::Healthy {
                    attempts,
                    elapsed: started.elapsed(),
                };
            }
            Ok(Err(err)) => {
                trace!(probe = %checker.describe(), attempts, error = %err, "probe not ready");
                last_error = Some(err.to_string());
            }
            Err(_) => {
                last_error = Some(HealthError::Timeout(budget).to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return ProbeOutcome::TimedOut {
                attempts,
                last_error,
            };
        }

        let pause = poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProbe {
        calls: AtomicU32,
        succeed_after: u32,
    }

    #[async_trait]
    impl Probe for FlakyProbe {
        async fn check(&self) -> Result<(), HealthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_after {
                Ok(())
            } else {
                Err(HealthError::Invalid("not yet".into()))
            }
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    #[tokio::test]
    async fn returns_first_success_without_waiting_out_timeout() {
        let flaky = FlakyProbe {
            calls: AtomicU32::new(0),
            succeed_after: 3,
        };
        let started = Instant::now();
        let outcome = poll_until_ready(
            &flaky,
            Duration::from_secs(30),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, ProbeOutcome::Healthy { attempts: 3, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn times_out_with_last_error() {
        let never = FlakyProbe {
            calls: AtomicU32::new(0),
            succeed_after: u32::MAX,
        };
        let outcome = poll_until_ready(
            &never,
            Duration::from_millis(100),
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await;

        match outcome {
            ProbeOutcome::TimedOut {
                attempts,
                last_error,
            } => {
                assert!(attempts >= 2);
                assert!(last_error.unwrap().contains("not yet"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let never = FlakyProbe {
            calls: AtomicU32::new(0),
            succeed_after: u32::MAX,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome =
            poll_until_ready(&never, Duration::from_secs(60), Duration::from_secs(1), &cancel)
                .await;
        assert_eq!(outcome, ProbeOutcome::Cancelled);
    }

    #[tokio::test]
    async fn no_readiness_check_is_immediately_healthy() {
        let spec = ServiceSpec::external("noop");
        let outcome = probe(
            &spec,
            Duration::from_secs(1),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.is_healthy());
    }
}
