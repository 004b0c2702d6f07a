//! Runtime Test Adapters
//!
//! One adapter per runtime family. An adapter knows the default command of
//! its test tool and how to read that tool's native report. Launching,
//! logging, timeouts and status mapping are shared in [`run_job`].

mod browser;
mod compiled;
mod interpreted;
mod runner;

pub use browser::BrowserAdapter;
pub use compiled::CompiledAdapter;
pub use interpreted::InterpretedAdapter;
pub use runner::{CommandOutcome, Invocation, Termination, run_logged};

use crate::model::{Category, Job, JobResult, JobStatus, Runtime, TestCounts};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const OUTPUT_LOG: &str = "output.log";

/// What a tool reported in its native format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReport {
    pub counts: TestCounts,
    /// Suites or packages that crashed outside of assertions.
    pub runtime_errors: u64,
    pub coverage: Option<f64>,
}

/// Per-invocation inputs supplied by the scheduler.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Directory for this job's log and artifacts.
    pub artifact_dir: PathBuf,
    /// Connection details and other overrides, applied before the job's own env.
    pub env: BTreeMap<String, String>,
    pub grace_period: Duration,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait TestAdapter: Send + Sync {
    fn runtime(&self) -> Runtime;

    fn display_name(&self) -> &'static str;

    /// Executable the default command needs on PATH.
    fn tool(&self) -> &'static str;

    fn default_command(&self, job: &Job) -> Vec<String>;

    /// Read the tool's native report from captured stdout. `None` when the
    /// output is not in the expected format.
    fn parse(&self, job: &Job, stdout: &str) -> Option<ParsedReport>;

    /// Remove artifacts of a previous invocation before the tool runs.
    fn prepare(&self, _job: &Job) -> std::io::Result<()> {
        Ok(())
    }

    fn validate(&self) -> Result<PathBuf, which::Error> {
        which::which(self.tool())
    }

    async fn run(&self, job: &Job, ctx: &RunContext) -> JobResult {
        run_job(self, job, ctx).await
    }
}

/// Launch the job's command, capture its output and map it to a result.
pub async fn run_job<A>(adapter: &A, job: &Job, ctx: &RunContext) -> JobResult
where
    A: TestAdapter + ?Sized,
{
    let started = Instant::now();
    let argv = job
        .command
        .clone()
        .unwrap_or_else(|| adapter.default_command(job));
    let log_path = ctx.artifact_dir.join(OUTPUT_LOG);

    if let Err(err) = adapter.prepare(job) {
        debug!(job = %job.id, error = %err, "could not clear stale artifacts");
    }

    let mut env = ctx.env.clone();
    env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let invocation = Invocation {
        argv,
        work_dir: job.work_dir.clone(),
        env,
        log_path: log_path.clone(),
        timeout: job.timeout,
        grace: ctx.grace_period,
    };

    let outcome = match run_logged(&invocation, &ctx.cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let program = invocation.argv.first().map_or("", String::as_str);
            warn!(job = %job.id, program, error = %err, "test tool failed to launch");
            let mut result = JobResult::errored(job, format!("failed to launch '{program}': {err}"))
                .with_duration(started.elapsed());
            if log_path.exists() {
                result.log_path = Some(log_path);
            }
            return result;
        }
    };

    let mut result = match outcome.termination {
        Termination::Cancelled => {
            JobResult::new(job, JobStatus::Cancelled).with_note("stopped by cancellation")
        }
        Termination::TimedOut(limit) => {
            JobResult::errored(job, format!("timed out after {limit:?}"))
        }
        Termination::Exited(status) => {
            let parsed = adapter.parse(job, &outcome.stdout);
            let mut result = classify(job, parsed.as_ref(), status.success(), status.code());
            if let Some(report) = parsed {
                result.counts = report.counts;
                if job.collect_coverage {
                    result.coverage = report.coverage;
                }
            }
            result
        }
    };

    result.duration_ms = outcome.elapsed.as_millis() as u64;
    result.log_path = Some(log_path);
    result
}

/// Status rules shared by every adapter.
fn classify(job: &Job, parsed: Option<&ParsedReport>, success: bool, code: Option<i32>) -> JobResult {
    let Some(code) = code else {
        return JobResult::errored(job, "terminated by signal");
    };

    let Some(report) = parsed else {
        return if success {
            JobResult::new(job, JobStatus::Passed)
        } else {
            JobResult::new(job, JobStatus::Failed)
                .with_note(format!("exited with code {code}; report not parseable"))
        };
    };

    if report.counts.failed > 0 {
        JobResult::new(job, JobStatus::Failed)
    } else if report.counts.errored > 0 || report.runtime_errors > 0 {
        JobResult::errored(
            job,
            format!(
                "{} suite error(s) outside assertions",
                report.counts.errored + report.runtime_errors
            ),
        )
    } else if !success {
        JobResult::new(job, JobStatus::Failed)
            .with_note(format!("exited with code {code} without failing tests"))
    } else {
        JobResult::new(job, JobStatus::Passed)
    }
}

/// First JSON object in `text` that starts a line. Tools often print
/// banners or warnings around their JSON report.
pub(crate) fn extract_json(text: &str) -> Option<serde_json::Value> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            let start = offset + (line.len() - line.trim_start().len());
            let mut stream =
                serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
            if let Some(Ok(value)) = stream.next()
                && value.is_object()
            {
                return Some(value);
            }
        }
        offset += line.len();
    }
    None
}

/// Adapters keyed by runtime.
pub struct AdapterRegistry {
    adapters: HashMap<Runtime, Arc<dyn TestAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn bootstrap() -> Self {
        let mut registry = Self::empty();
        registry.register(CompiledAdapter::new());
        registry.register(InterpretedAdapter::new());
        registry.register(BrowserAdapter::new());
        registry
    }

    pub fn register<A>(&mut self, adapter: A)
    where
        A: TestAdapter + 'static,
    {
        self.adapters.insert(adapter.runtime(), Arc::new(adapter));
    }

    pub fn resolve(&self, runtime: Runtime) -> Option<Arc<dyn TestAdapter>> {
        self.adapters.get(&runtime).cloned()
    }

    pub fn contains(&self, runtime: Runtime) -> bool {
        self.adapters.contains_key(&runtime)
    }

    /// Registered adapters in runtime order.
    pub fn adapters(&self) -> Vec<Arc<dyn TestAdapter>> {
        let mut adapters: Vec<_> = self.adapters.values().cloned().collect();
        adapters.sort_by_key(|a| a.runtime());
        adapters
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::bootstrap()
    }
}

/// Directory for a job's artifacts: `<root>/<runtime>/<category>/<slug>`.
pub fn artifact_dir(root: &Path, job: &Job) -> PathBuf {
    artifact_dir_for(root, job.runtime, job.category, job.slug())
}

pub fn artifact_dir_for(root: &Path, runtime: Runtime, category: Category, slug: &str) -> PathBuf {
    root.join(runtime.as_str()).join(category.as_str()).join(slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(Runtime::Compiled, Category::Unit, "gateway")
    }

    fn report(passed: u64, failed: u64, runtime_errors: u64) -> ParsedReport {
        ParsedReport {
            counts: TestCounts {
                passed,
                failed,
                ..TestCounts::default()
            },
            runtime_errors,
            coverage: None,
        }
    }

    #[test]
    fn classification_rules() {
        let job = job();
        assert_eq!(
            classify(&job, Some(&report(3, 0, 0)), true, Some(0)).status,
            JobStatus::Passed
        );
        assert_eq!(
            classify(&job, Some(&report(3, 1, 0)), false, Some(1)).status,
            JobStatus::Failed
        );
        assert_eq!(
            classify(&job, Some(&report(0, 0, 1)), false, Some(1)).status,
            JobStatus::Errored
        );
        assert_eq!(classify(&job, None, true, Some(0)).status, JobStatus::Passed);
        assert_eq!(classify(&job, None, false, Some(2)).status, JobStatus::Failed);
        assert_eq!(classify(&job, None, false, None).status, JobStatus::Errored);
    }

    #[test]
    fn extract_json_skips_banners() {
        let text = "Determining test suites...\n  {\"numPassedTests\": 2}\ntrailing\n";
        let value = extract_json(text).unwrap();
        assert_eq!(value["numPassedTests"], 2);
        assert!(extract_json("no json here\n{not json").is_none());
    }

    #[test]
    fn registry_resolves_every_runtime() {
        let registry = AdapterRegistry::bootstrap();
        for runtime in Runtime::ALL {
            let adapter = registry.resolve(runtime).unwrap();
            assert_eq!(adapter.runtime(), runtime);
        }
        assert!(!AdapterRegistry::empty().contains(Runtime::Browser));
    }

    #[test]
    fn artifact_dir_is_runtime_category_slug() {
        let dir = artifact_dir(Path::new("results"), &job());
        assert_eq!(dir, PathBuf::from("results/compiled/unit/gateway"));
    }

    #[cfg(unix)]
    mod run {
        use super::*;

        fn context(dir: &Path) -> RunContext {
            RunContext {
                artifact_dir: dir.join("artifacts"),
                env: BTreeMap::from([("DB_URL".to_string(), "postgres://db".to_string())]),
                grace_period: Duration::from_secs(1),
                cancel: CancellationToken::new(),
            }
        }

        fn scripted(script: &str, dir: &Path) -> Job {
            let mut job = Job::new(Runtime::Compiled, Category::Unit, "scripted")
                .with_command(vec!["sh".into(), "-c".into(), script.into()]);
            job.work_dir = dir.to_path_buf();
            job
        }

        #[tokio::test]
        async fn passing_command_writes_log() {
            let dir = tempfile::tempdir().unwrap();
            let job = scripted("echo $DB_URL", dir.path());
            let result = CompiledAdapter::new().run(&job, &context(dir.path())).await;
            assert_eq!(result.status, JobStatus::Passed);
            let log = std::fs::read_to_string(result.log_path.unwrap()).unwrap();
            assert!(log.contains("postgres://db"));
        }

        #[tokio::test]
        async fn job_env_overrides_context_env() {
            let dir = tempfile::tempdir().unwrap();
            let mut job = scripted("test \"$DB_URL\" = local", dir.path());
            job.env.insert("DB_URL".into(), "local".into());
            let result = CompiledAdapter::new().run(&job, &context(dir.path())).await;
            assert_eq!(result.status, JobStatus::Passed);
        }

        #[tokio::test]
        async fn missing_tool_is_errored() {
            let dir = tempfile::tempdir().unwrap();
            let job = Job::new(Runtime::Interpreted, Category::Unit, "ghost")
                .with_command(vec!["/no/such/runner".into()]);
            let result = InterpretedAdapter::new().run(&job, &context(dir.path())).await;
            assert_eq!(result.status, JobStatus::Errored);
            assert!(result.note.unwrap().contains("failed to launch"));
        }

        #[tokio::test]
        async fn per_job_timeout_is_errored() {
            let dir = tempfile::tempdir().unwrap();
            let mut job = scripted("sleep 30", dir.path());
            job.timeout = Some(Duration::from_millis(200));
            let result = CompiledAdapter::new().run(&job, &context(dir.path())).await;
            assert_eq!(result.status, JobStatus::Errored);
            assert!(result.note.unwrap().contains("timed out"));
        }
    }
}
