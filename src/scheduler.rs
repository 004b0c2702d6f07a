//! Work Queue Scheduler
//!
//! Greedy FIFO dispatch onto a bounded worker pool. A job waits in the queue
//! until a slot frees up, then either runs on its runtime's adapter or is
//! resolved as Skipped without dispatch because a service it requires is not
//! Healthy.

use crate::adapter::{AdapterRegistry, RunContext, TestAdapter, artifact_dir};
use crate::model::{Job, JobResult, JobStatus};
use crate::report::ResultCollector;
use crate::service::ServiceState;
use crate::supervisor::Supervisor;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Tells the scheduler which required services are not Healthy.
pub trait ServiceGate: Send + Sync {
    fn unhealthy(&self, required: &[String]) -> Vec<String>;
}

impl ServiceGate for Supervisor {
    fn unhealthy(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.is_healthy(name))
            .cloned()
            .collect()
    }
}

impl ServiceGate for HashMap<String, ServiceState> {
    fn unhealthy(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| self.get(*name) != Some(&ServiceState::Healthy))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrency: usize,
    pub fail_fast: bool,
    pub grace_period: Duration,
    /// Root of the per-job artifact tree.
    pub results_dir: PathBuf,
    /// Passed to every job before its own env.
    pub env: BTreeMap<String, String>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            fail_fast: false,
            grace_period: Duration::from_secs(10),
            results_dir: PathBuf::from("test-results"),
            env: BTreeMap::new(),
        }
    }
}

/// FIFO of jobs waiting for a worker. Shared between the dispatcher and the
/// drain on abort, so it sits behind a mutex.
#[derive(Default)]
pub struct WorkQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl WorkQueue {
    pub fn new(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().collect()),
        }
    }

    pub fn pop(&self) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Remove and return every job still waiting.
    pub fn drain(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the dispatch loop ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub dispatched: usize,
    /// Skipped because a required service was not Healthy.
    pub gated: usize,
    /// Never dispatched because the run was cancelled or halted.
    pub drained: usize,
    pub cancelled: bool,
    /// A failure stopped dispatch under fail-fast.
    pub halted: bool,
}

pub struct Scheduler {
    registry: Arc<AdapterRegistry>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(registry: Arc<AdapterRegistry>, options: SchedulerOptions) -> Self {
        Self { registry, options }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Run every job, recording exactly one result per job into `collector`.
    pub async fn run(
        &self,
        jobs: Vec<Job>,
        gate: Arc<dyn ServiceGate>,
        collector: Arc<ResultCollector>,
        cancel: &CancellationToken,
    ) -> ScheduleOutcome {
        let total = jobs.len();
        let queue = WorkQueue::new(jobs);
        let slots = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut workers = JoinSet::new();
        let mut outcome = ScheduleOutcome::default();

        info!(
            jobs = total,
            max_concurrency = self.options.max_concurrency,
            fail_fast = self.options.fail_fast,
            "dispatching jobs"
        );

        loop {
            if queue.is_empty() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
                break;
            }
            let Some(job) = queue.pop() else {
                break;
            };

            let down = gate.unhealthy(&job.requires);
            if !down.is_empty() {
                debug!(job = %job.id, services = ?down, "skipping job");
                outcome.gated += 1;
                collector.record(JobResult::skipped(
                    &job,
                    format!("required service(s) not healthy: {}", down.join(", ")),
                ));
                continue;
            }

            let Some(adapter) = self.registry.resolve(job.runtime) else {
                error!(job = %job.id, runtime = %job.runtime, "no adapter registered");
                collector.record(JobResult::errored(
                    &job,
                    format!("no adapter for runtime '{}'", job.runtime),
                ));
                continue;
            };

            let ctx = RunContext {
                artifact_dir: artifact_dir(&self.options.results_dir, &job),
                env: self.options.env.clone(),
                grace_period: self.options.grace_period,
                cancel: cancel.clone(),
            };
            let collector = Arc::clone(&collector);
            let halted = Arc::clone(&halted);
            let fail_fast = self.options.fail_fast;

            outcome.dispatched += 1;
            debug!(job = %job.id, "dispatched");
            workers.spawn(async move {
                let result = AssertUnwindSafe(run_with_retries(adapter.as_ref(), &job, &ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(job = %job.id, "job worker panicked");
                        JobResult::errored(&job, "adapter panicked while running the job")
                    });
                if fail_fast && result.status.is_failure() && !halted.swap(true, Ordering::SeqCst) {
                    warn!(job = %job.id, status = %result.status, "fail-fast: halting dispatch");
                }
                collector.record(result);
                drop(permit);
            });
        }

        let cancelled = cancel.is_cancelled();
        let remaining = queue.drain();
        outcome.drained = remaining.len();
        if !remaining.is_empty() {
            let reason = if cancelled {
                "run cancelled before dispatch"
            } else {
                "not run: fail-fast after an earlier failure"
            };
            info!(jobs = remaining.len(), reason, "draining queue");
            for job in remaining {
                collector.record(JobResult::skipped(&job, reason));
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "job worker panicked");
            }
        }

        outcome.cancelled = cancelled || cancel.is_cancelled();
        outcome.halted = halted.load(Ordering::SeqCst);
        outcome
    }
}

/// Re-run a Failed or Errored job up to its retry budget. Only the last
/// attempt is kept.
pub async fn run_with_retries(adapter: &dyn TestAdapter, job: &Job, ctx: &RunContext) -> JobResult {
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut result = adapter.run(job, ctx).await;
        result.attempts = attempt;

        let retry = result.status.is_retryable()
            && attempt <= job.retries
            && !ctx.cancel.is_cancelled();
        if !retry {
            if attempt > 1 {
                result.duration_ms = started.elapsed().as_millis() as u64;
            }
            if result.status == JobStatus::Passed && attempt > 1 {
                info!(job = %job.id, attempts = attempt, "passed after retry");
            }
            return result;
        }
        warn!(job = %job.id, attempt, status = %result.status, "retrying job");
    }
}
