//! Orchestrator Driver
//!
//! Top-level state machine for one run:
//!
//! ```text
//! Init -> ResolveDependencies -> StartInfrastructure -> AwaitHealthy
//!      -> RunJobs -> Aggregate -> Teardown -> Done
//! ```
//!
//! A fatal error in StartInfrastructure, AwaitHealthy or RunJobs moves to
//! Abort, which always continues to Teardown. Configuration errors are
//! returned from ResolveDependencies before anything is started.

use crate::adapter::AdapterRegistry;
use crate::config::{Settings, StackConfig};
use crate::error::{Error, Result};
use crate::graph::StartupPlan;
use crate::model::JobResult;
use crate::report::{ReportOptions, ResultCollector, RunReport};
use crate::scheduler::{ScheduleOutcome, Scheduler, SchedulerOptions, ServiceGate};
use crate::service::ServiceState;
use crate::supervisor::{LaunchContext, Supervisor, SupervisorOptions};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Subdirectory of the results dir holding service process logs.
pub const SERVICE_LOG_DIR: &str = "services";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ResolveDependencies,
    StartInfrastructure,
    AwaitHealthy,
    RunJobs,
    Aggregate,
    Abort,
    Teardown,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::ResolveDependencies => "resolve-dependencies",
            Phase::StartInfrastructure => "start-infrastructure",
            Phase::AwaitHealthy => "await-healthy",
            Phase::RunJobs => "run-jobs",
            Phase::Aggregate => "aggregate",
            Phase::Abort => "abort",
            Phase::Teardown => "teardown",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub exit_code: i32,
    /// Every phase entered, in order.
    pub phases: Vec<Phase>,
    /// `None` when the run aborted before RunJobs.
    pub schedule: Option<ScheduleOutcome>,
    /// Service states after teardown.
    pub final_states: Vec<(String, ServiceState)>,
    pub timed_out: bool,
}

pub struct Driver {
    config: StackConfig,
    registry: Arc<AdapterRegistry>,
    phases: Vec<Phase>,
}

impl Driver {
    pub fn new(config: StackConfig, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            config,
            registry,
            phases: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        info!(phase = %phase, "entering phase");
        self.phases.push(phase);
    }

    /// Drive one full run. `Err` is only returned for configuration errors
    /// and a results directory that cannot be created; every other failure
    /// ends up in the outcome's report and exit code.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunOutcome> {
        self.enter(Phase::Init);
        let settings = self.config.settings.clone();

        self.enter(Phase::ResolveDependencies);
        let plan = self.config.validate(&self.registry)?;
        info!(
            waves = plan.waves.len(),
            services = plan.service_count(),
            jobs = self.config.jobs.len(),
            "configuration resolved"
        );

        let collector = Arc::new(ResultCollector::persistent(&settings.results_dir)?);
        let supervisor = supervisor_for(&self.config);

        let run_cancel = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = settings.global_timeout.map(|limit| {
            let token = run_cancel.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        warn!(timeout_secs = limit.as_secs(), "global timeout reached, cancelling run");
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        self.enter(Phase::StartInfrastructure);
        for err in supervisor.cleanup_stale().await {
            warn!(error = %err, "stale cleanup failed");
        }
        let mut startup = supervisor.start_all(&plan, &run_cancel).await;

        if startup.is_ok() {
            self.enter(Phase::AwaitHealthy);
            startup = self.await_healthy(&supervisor);
        }

        let (report, schedule) = match startup {
            Err(err) => {
                self.enter(Phase::Abort);
                error!(error = %err, kind = err.kind(), "startup failed, no job will run");
                let reason = match &err {
                    Error::Cancelled => "run cancelled during startup".to_string(),
                    other => other.to_string(),
                };
                for job in &self.config.jobs {
                    collector.record(JobResult::skipped(job, format!("not run: {reason}")));
                }
                let report = self.aggregate(
                    &collector,
                    &supervisor,
                    run_cancel.is_cancelled(),
                    Some(reason),
                );
                self.teardown(&supervisor, &plan, true).await;
                self.finish(timer);
                let exit_code = match err {
                    Error::Cancelled => report.exit_code(),
                    other => other.exit_code(),
                };
                return Ok(self.outcome(report, exit_code, None, &supervisor, &timed_out));
            }
            Ok(()) => {
                self.enter(Phase::RunJobs);
                let schedule = self
                    .run_jobs(&supervisor, Arc::clone(&collector), &run_cancel, &settings)
                    .await;

                if schedule.cancelled {
                    self.enter(Phase::Abort);
                    warn!(
                        dispatched = schedule.dispatched,
                        drained = schedule.drained,
                        "run cancelled while jobs were running"
                    );
                } else {
                    self.enter(Phase::Aggregate);
                }
                let report = self.aggregate(&collector, &supervisor, schedule.cancelled, None);
                (report, schedule)
            }
        };

        let aborted = schedule.cancelled;
        self.teardown(&supervisor, &plan, aborted).await;
        self.finish(timer);
        let exit_code = report.exit_code();
        Ok(self.outcome(report, exit_code, Some(schedule), &supervisor, &timed_out))
    }

    fn await_healthy(&self, supervisor: &Supervisor) -> Result<()> {
        for (name, state) in supervisor.states() {
            if state != ServiceState::Healthy {
                let timeout = self
                    .config
                    .service(&name)
                    .map(|s| s.startup_timeout)
                    .unwrap_or_default();
                return Err(Error::ServiceUnhealthy {
                    service: name,
                    timeout,
                });
            }
        }
        Ok(())
    }

    async fn run_jobs(
        &self,
        supervisor: &Arc<Supervisor>,
        collector: Arc<ResultCollector>,
        cancel: &CancellationToken,
        settings: &Settings,
    ) -> ScheduleOutcome {
        let monitor_stop = cancel.child_token();
        let monitor = settings
            .liveness_interval
            .filter(|_| !self.config.services.is_empty())
            .map(|interval| supervisor.spawn_liveness(interval, monitor_stop.clone()));

        let scheduler = Scheduler::new(
            Arc::clone(&self.registry),
            SchedulerOptions {
                max_concurrency: settings.max_concurrency,
                fail_fast: settings.fail_fast,
                grace_period: settings.grace_period,
                results_dir: settings.results_dir.clone(),
                env: self.config.env.clone(),
            },
        );
        let gate: Arc<dyn ServiceGate> = Arc::clone(supervisor) as Arc<dyn ServiceGate>;
        let outcome = scheduler
            .run(self.config.jobs.clone(), gate, collector, cancel)
            .await;

        monitor_stop.cancel();
        if let Some(monitor) = monitor
            && let Err(err) = monitor.await
        {
            warn!(error = %err, "liveness monitor ended abnormally");
        }
        outcome
    }

    fn aggregate(
        &self,
        collector: &ResultCollector,
        supervisor: &Supervisor,
        cancelled: bool,
        aborted: Option<String>,
    ) -> RunReport {
        let settings = &self.config.settings;
        let report = collector.build_report(ReportOptions {
            coverage_threshold: settings.coverage_threshold,
            cancelled,
            services: supervisor.states(),
            aborted,
        });
        if let Err(err) = report.write(&settings.results_dir) {
            error!(error = %err, "could not write the run report");
        }
        info!(
            jobs = report.totals.jobs,
            passed = report.totals.passed,
            failed = report.totals.failed,
            errored = report.totals.errored,
            skipped = report.totals.skipped,
            cancelled = report.totals.cancelled,
            coverage = ?report.coverage,
            "run aggregated"
        );
        report
    }

    /// Teardown is skipped on request only after a clean run.
    async fn teardown(&mut self, supervisor: &Supervisor, plan: &StartupPlan, aborted: bool) {
        self.enter(Phase::Teardown);
        if self.config.settings.skip_teardown && !aborted {
            warn!("skip_teardown set, leaving services running");
            return;
        }
        for err in supervisor.teardown(plan).await {
            warn!(error = %err, "teardown error");
        }
    }

    fn finish(&mut self, timer: Option<JoinHandle<()>>) {
        if let Some(timer) = timer {
            timer.abort();
        }
        self.enter(Phase::Done);
    }

    fn outcome(
        &self,
        report: RunReport,
        exit_code: i32,
        schedule: Option<ScheduleOutcome>,
        supervisor: &Supervisor,
        timed_out: &AtomicBool,
    ) -> RunOutcome {
        RunOutcome {
            report,
            exit_code,
            phases: self.phases.clone(),
            schedule,
            final_states: supervisor.states(),
            timed_out: timed_out.load(Ordering::SeqCst),
        }
    }
}

/// Supervisor for the configured services, logging process output under
/// the results directory.
pub fn supervisor_for(config: &StackConfig) -> Arc<Supervisor> {
    let settings = &config.settings;
    Arc::new(Supervisor::new(
        config.services.clone(),
        SupervisorOptions {
            grace_period: settings.grace_period,
            launch: LaunchContext {
                log_dir: Some(settings.results_dir.join(SERVICE_LOG_DIR)),
                compose: Arc::new(config.compose.clone()),
            },
        },
    ))
}

/// Start the infrastructure and keep it up until `cancel` fires. Returns
/// the service states observed just before teardown.
pub async fn bring_up(
    config: &StackConfig,
    registry: &AdapterRegistry,
    cancel: CancellationToken,
) -> Result<Vec<(String, ServiceState)>> {
    let plan = config.validate(registry)?;
    let supervisor = supervisor_for(config);

    for err in supervisor.cleanup_stale().await {
        warn!(error = %err, "stale cleanup failed");
    }
    supervisor.start_all(&plan, &cancel).await?;
    info!(services = plan.service_count(), "infrastructure is up, interrupt to stop");

    let monitor = config
        .settings
        .liveness_interval
        .map(|interval| supervisor.spawn_liveness(interval, cancel.clone()));
    cancel.cancelled().await;
    if let Some(monitor) = monitor
        && let Err(err) = monitor.await
    {
        warn!(error = %err, "liveness monitor ended abnormally");
    }

    let states = supervisor.states();
    for err in supervisor.teardown(&plan).await {
        warn!(error = %err, "teardown error");
    }
    Ok(states)
}

/// Remove containers and compose stacks a previous run left behind.
pub async fn tear_down(config: &StackConfig) -> Vec<Error> {
    supervisor_for(config).cleanup_stale().await
}
