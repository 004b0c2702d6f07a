//! Result Aggregator & Reporter
//!
//! Results stream into a [`ResultCollector`] as jobs finish. Each one is
//! written to disk immediately so a long run can be followed live. At the end
//! the collector is folded into a [`RunReport`] grouped by runtime and
//! category.

use crate::adapter::artifact_dir_for;
use crate::error::{EXIT_FAILED, EXIT_OK, Error, Result};
use crate::model::{Category, JobResult, JobStatus, Runtime, TestCounts};
use crate::service::ServiceState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

pub const RESULTS_STREAM: &str = "results.jsonl";
pub const REPORT_TEXT: &str = "report.txt";
pub const SUMMARY_JSON: &str = "summary.json";
pub const RESULT_JSON: &str = "result.json";
pub const COVERAGE_JSON: &str = "coverage.json";

#[derive(Default)]
struct CollectorState {
    results: Vec<JobResult>,
    seen: HashSet<String>,
    stream: Option<File>,
}

/// Thread-safe sink for job results. Every access goes through one mutex.
pub struct ResultCollector {
    root: Option<PathBuf>,
    started_at: DateTime<Utc>,
    state: Mutex<CollectorState>,
}

impl ResultCollector {
    /// Keeps results in memory only.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            started_at: Utc::now(),
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Writes per-job artifacts under `root` and streams every result to
    /// `results.jsonl`.
    pub fn persistent(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| report_error(&root, e))?;
        let stream_path = root.join(RESULTS_STREAM);
        let stream = File::create(&stream_path).map_err(|e| report_error(&stream_path, e))?;
        Ok(Self {
            root: Some(root),
            started_at: Utc::now(),
            state: Mutex::new(CollectorState {
                stream: Some(stream),
                ..CollectorState::default()
            }),
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store one result. A second result for the same job is dropped.
    pub fn record(&self, result: JobResult) {
        let mut state = self.lock();
        if !state.seen.insert(result.job_id.clone()) {
            warn!(job = %result.job_id, "duplicate result ignored");
            return;
        }

        info!(
            job = %result.job_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            passed = result.counts.passed,
            failed = result.counts.failed,
            coverage = ?result.coverage,
            note = result.note.as_deref().unwrap_or(""),
            "job finished"
        );

        if let Some(root) = &self.root {
            if let Err(err) = write_job_artifacts(root, &result) {
                warn!(job = %result.job_id, error = %err, "could not write job artifacts");
            }
            if let Some(stream) = state.stream.as_mut() {
                let line = serde_json::to_string(&result).map_err(Error::from).and_then(|json| {
                    writeln!(stream, "{json}")?;
                    stream.flush()?;
                    Ok(())
                });
                if let Err(err) = line {
                    warn!(error = %err, "could not append to results stream");
                }
            }
        }

        state.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().seen.contains(job_id)
    }

    /// Results in arrival order.
    pub fn snapshot(&self) -> Vec<JobResult> {
        self.lock().results.clone()
    }

    pub fn build_report(&self, options: ReportOptions) -> RunReport {
        RunReport::build(self.snapshot(), self.started_at, options)
    }
}

fn report_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Report {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn write_job_artifacts(root: &Path, result: &JobResult) -> Result<()> {
    let dir = artifact_dir_for(root, result.runtime, result.category, result.slug());
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(RESULT_JSON), serde_json::to_vec_pretty(result)?)?;
    let coverage_path = dir.join(COVERAGE_JSON);
    match result.coverage {
        Some(percent) => {
            let coverage = serde_json::json!({ "percent": percent });
            fs::write(&coverage_path, serde_json::to_vec_pretty(&coverage)?)?;
        }
        None => match fs::remove_file(&coverage_path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        },
    }
    Ok(())
}

/// Run-level inputs that are not part of any job result.
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    /// Minimum aggregate coverage in percent. `None` or zero disables the check.
    pub coverage_threshold: Option<f64>,
    pub cancelled: bool,
    pub services: Vec<(String, ServiceState)>,
    /// Set when the run aborted before any job ran.
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusTally {
    pub jobs: u64,
    pub passed: u64,
    pub failed: u64,
    pub errored: u64,
    pub skipped: u64,
    pub cancelled: u64,
}

impl StatusTally {
    fn add(&mut self, status: JobStatus) {
        self.jobs += 1;
        match status {
            JobStatus::Passed => self.passed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Errored => self.errored += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn failures(&self) -> u64 {
        self.failed + self.errored + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub runtime: Runtime,
    pub category: Category,
    #[serde(flatten)]
    pub jobs: StatusTally,
    pub tests: TestCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRef {
    pub id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
}

impl JobRef {
    fn from_result(result: &JobResult) -> Self {
        Self {
            id: result.job_id.clone(),
            status: result.status,
            reason: result.note.clone(),
            log: result.log_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub state: ServiceState,
}

/// Final, machine-readable outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: StatusTally,
    pub tests: TestCounts,
    pub groups: Vec<GroupSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_threshold: Option<f64>,
    pub threshold_met: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub failed_jobs: Vec<JobRef>,
    pub skipped_jobs: Vec<JobRef>,
    pub services: Vec<ServiceSummary>,
    pub results: Vec<JobResult>,
}

impl RunReport {
    pub fn build(
        mut results: Vec<JobResult>,
        started_at: DateTime<Utc>,
        options: ReportOptions,
    ) -> Self {
        results.sort_by(|a, b| {
            (a.runtime, a.category, &a.job_id).cmp(&(b.runtime, b.category, &b.job_id))
        });

        let mut totals = StatusTally::default();
        let mut tests = TestCounts::default();
        let mut groups: BTreeMap<(Runtime, Category), (StatusTally, TestCounts, Vec<f64>)> =
            BTreeMap::new();
        let mut all_coverage = Vec::new();

        for result in &results {
            totals.add(result.status);
            tests.add(&result.counts);

            let group = groups
                .entry((result.runtime, result.category))
                .or_default();
            group.0.add(result.status);
            group.1.add(&result.counts);
            if let Some(percent) = result.coverage {
                group.2.push(percent);
                all_coverage.push(percent);
            }
        }

        let groups = groups
            .into_iter()
            .map(|((runtime, category), (jobs, tests, coverage))| GroupSummary {
                runtime,
                category,
                jobs,
                tests,
                coverage: average(&coverage),
            })
            .collect();

        let coverage = average(&all_coverage);
        let coverage_threshold = options.coverage_threshold.filter(|t| *t > 0.0);
        let threshold_met = match coverage_threshold {
            None => true,
            Some(threshold) => coverage.is_some_and(|c| c >= threshold),
        };

        let failed_jobs = results
            .iter()
            .filter(|r| r.status.is_failure())
            .map(JobRef::from_result)
            .collect();
        let skipped_jobs = results
            .iter()
            .filter(|r| r.status == JobStatus::Skipped)
            .map(JobRef::from_result)
            .collect();

        Self {
            started_at,
            finished_at: Utc::now(),
            totals,
            tests,
            groups,
            coverage,
            coverage_threshold,
            threshold_met,
            cancelled: options.cancelled,
            aborted: options.aborted,
            failed_jobs,
            skipped_jobs,
            services: options
                .services
                .into_iter()
                .map(|(name, state)| ServiceSummary { name, state })
                .collect(),
            results,
        }
    }

    /// Whether the run counts as a success on its own terms.
    pub fn passed(&self) -> bool {
        self.totals.failures() == 0
            && self.threshold_met
            && !self.cancelled
            && self.aborted.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() { EXIT_OK } else { EXIT_FAILED }
    }

    fn verdict(&self) -> &'static str {
        if self.aborted.is_some() {
            "ABORTED"
        } else if self.cancelled {
            "CANCELLED"
        } else if self.passed() {
            "PASSED"
        } else {
            "FAILED"
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Test run {} ({})",
            self.verdict(),
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<12} {:<12} {:>5} {:>6} {:>6} {:>6} {:>6} {:>6} {:>7} {:>9}",
            "RUNTIME", "CATEGORY", "JOBS", "PASS", "FAIL", "ERROR", "SKIP", "CANCEL", "TESTS", "COVERAGE"
        );
        for group in &self.groups {
            let _ = writeln!(
                out,
                "{:<12} {:<12} {:>5} {:>6} {:>6} {:>6} {:>6} {:>6} {:>7} {:>9}",
                group.runtime.as_str(),
                group.category.as_str(),
                group.jobs.jobs,
                group.jobs.passed,
                group.jobs.failed,
                group.jobs.errored,
                group.jobs.skipped,
                group.jobs.cancelled,
                group.tests.total(),
                format_percent(group.coverage),
            );
        }
        let _ = writeln!(
            out,
            "{:<12} {:<12} {:>5} {:>6} {:>6} {:>6} {:>6} {:>6} {:>7} {:>9}",
            "TOTAL",
            "",
            self.totals.jobs,
            self.totals.passed,
            self.totals.failed,
            self.totals.errored,
            self.totals.skipped,
            self.totals.cancelled,
            self.tests.total(),
            format_percent(self.coverage),
        );

        let _ = writeln!(out);
        match self.coverage_threshold {
            Some(threshold) => {
                let _ = writeln!(
                    out,
                    "Coverage: {} (threshold {threshold:.0}%: {})",
                    format_percent(self.coverage),
                    if self.threshold_met { "met" } else { "NOT MET" }
                );
            }
            None => {
                let _ = writeln!(out, "Coverage: {}", format_percent(self.coverage));
            }
        }

        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "\nAborted before any job ran: {reason}");
        }

        if !self.services.is_empty() {
            let _ = writeln!(out, "\nServices:");
            for service in &self.services {
                let _ = writeln!(out, "  {:<20} {}", service.name, service.state);
            }
        }

        if !self.failed_jobs.is_empty() {
            let _ = writeln!(out, "\nFailed jobs:");
            for job in &self.failed_jobs {
                let _ = write!(out, "  {} [{}]", job.id, job.status);
                if let Some(reason) = &job.reason {
                    let _ = write!(out, " {reason}");
                }
                if let Some(log) = &job.log {
                    let _ = write!(out, " (log: {})", log.display());
                }
                let _ = writeln!(out);
            }
        }

        if !self.skipped_jobs.is_empty() {
            let _ = writeln!(out, "\nSkipped jobs:");
            for job in &self.skipped_jobs {
                let _ = writeln!(
                    out,
                    "  {} {}",
                    job.id,
                    job.reason.as_deref().unwrap_or("")
                );
            }
        }

        if self.cancelled {
            let _ = writeln!(
                out,
                "\nRun was cancelled: {} in-flight job(s) stopped, {} job(s) never dispatched.",
                self.totals.cancelled, self.totals.skipped
            );
        }

        out
    }

    /// Write `report.txt` and `summary.json` into `root`.
    pub fn write(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root).map_err(|e| report_error(root, e))?;

        let text_path = root.join(REPORT_TEXT);
        fs::write(&text_path, self.render_text()).map_err(|e| report_error(&text_path, e))?;

        let summary_path = root.join(SUMMARY_JSON);
        let json = serde_json::to_vec_pretty(self)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&summary_path)
            .map_err(|e| report_error(&summary_path, e))?;
        file.write_all(&json)
            .map_err(|e| report_error(&summary_path, e))?;
        Ok(())
    }
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn format_percent(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}%"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Job;

    fn result(runtime: Runtime, category: Category, target: &str, status: JobStatus) -> JobResult {
        let job = Job::new(runtime, category, target);
        let mut result = JobResult::new(&job, status);
        result.counts = TestCounts {
            passed: 3,
            failed: u64::from(status == JobStatus::Failed),
            ..TestCounts::default()
        };
        result
    }

    fn with_coverage(mut result: JobResult, percent: f64) -> JobResult {
        result.coverage = Some(percent);
        result
    }

    #[test]
    fn groups_by_runtime_and_category() {
        let report = RunReport::build(
            vec![
                with_coverage(
                    result(Runtime::Compiled, Category::Unit, "a", JobStatus::Passed),
                    80.0,
                ),
                with_coverage(
                    result(Runtime::Compiled, Category::Unit, "b", JobStatus::Failed),
                    60.0,
                ),
                result(Runtime::Browser, Category::E2e, "c", JobStatus::Skipped),
            ],
            Utc::now(),
            ReportOptions::default(),
        );

        assert_eq!(report.groups.len(), 2);
        let unit = &report.groups[0];
        assert_eq!((unit.runtime, unit.category), (Runtime::Compiled, Category::Unit));
        assert_eq!(unit.jobs.passed, 1);
        assert_eq!(unit.jobs.failed, 1);
        assert_eq!(unit.coverage, Some(70.0));
        assert_eq!(report.totals.skipped, 1);
        assert_eq!(report.failed_jobs.len(), 1);
        assert_eq!(report.skipped_jobs.len(), 1);
        assert_eq!(report.exit_code(), EXIT_FAILED);
    }

    #[test]
    fn skipped_jobs_do_not_fail_the_run() {
        let report = RunReport::build(
            vec![
                result(Runtime::Compiled, Category::Unit, "a", JobStatus::Passed),
                result(Runtime::Interpreted, Category::Integration, "b", JobStatus::Skipped),
            ],
            Utc::now(),
            ReportOptions::default(),
        );
        assert_eq!(report.exit_code(), EXIT_OK);
        assert!(report.render_text().contains("Skipped jobs:"));
    }

    #[test]
    fn coverage_below_threshold_fails_even_when_all_pass() {
        let report = RunReport::build(
            vec![with_coverage(
                result(Runtime::Compiled, Category::Unit, "a", JobStatus::Passed),
                72.0,
            )],
            Utc::now(),
            ReportOptions {
                coverage_threshold: Some(80.0),
                ..ReportOptions::default()
            },
        );
        assert!(!report.threshold_met);
        assert_eq!(report.exit_code(), EXIT_FAILED);
        assert!(report.render_text().contains("NOT MET"));
    }

    #[test]
    fn missing_coverage_does_not_meet_a_threshold() {
        let report = RunReport::build(
            vec![result(Runtime::Browser, Category::E2e, "a", JobStatus::Passed)],
            Utc::now(),
            ReportOptions {
                coverage_threshold: Some(50.0),
                ..ReportOptions::default()
            },
        );
        assert!(!report.threshold_met);

        let disabled = RunReport::build(
            vec![result(Runtime::Browser, Category::E2e, "a", JobStatus::Passed)],
            Utc::now(),
            ReportOptions {
                coverage_threshold: Some(0.0),
                ..ReportOptions::default()
            },
        );
        assert!(disabled.threshold_met);
    }

    #[test]
    fn cancellation_is_reported_distinctly() {
        let report = RunReport::build(
            vec![
                result(Runtime::Compiled, Category::Unit, "a", JobStatus::Cancelled),
                result(Runtime::Compiled, Category::Unit, "b", JobStatus::Skipped),
            ],
            Utc::now(),
            ReportOptions {
                cancelled: true,
                ..ReportOptions::default()
            },
        );
        let text = report.render_text();
        assert!(text.starts_with("Test run CANCELLED"));
        assert!(text.contains("1 in-flight job(s) stopped, 1 job(s) never dispatched"));
        assert_eq!(report.exit_code(), EXIT_FAILED);
    }

    #[test]
    fn tallies_do_not_depend_on_arrival_order() {
        let results = vec![
            result(Runtime::Compiled, Category::Unit, "a", JobStatus::Passed),
            result(Runtime::Interpreted, Category::Unit, "b", JobStatus::Failed),
            result(Runtime::Compiled, Category::Unit, "c", JobStatus::Errored),
        ];
        let mut reversed = results.clone();
        reversed.reverse();
        let started = Utc::now();
        let a = RunReport::build(results, started, ReportOptions::default());
        let b = RunReport::build(reversed, started, ReportOptions::default());
        assert_eq!(a.groups, b.groups);
        assert_eq!(a.totals, b.totals);
    }

    #[test]
    fn collector_streams_results_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ResultCollector::persistent(dir.path()).unwrap();
        collector.record(with_coverage(
            result(Runtime::Compiled, Category::Unit, "gateway", JobStatus::Passed),
            91.0,
        ));
        collector.record(result(Runtime::Compiled, Category::Unit, "gateway", JobStatus::Failed));
        assert_eq!(collector.len(), 1);

        let job_dir = dir.path().join("compiled/unit/gateway");
        let stored: JobResult =
            serde_json::from_slice(&fs::read(job_dir.join(RESULT_JSON)).unwrap()).unwrap();
        assert_eq!(stored.status, JobStatus::Passed);
        let coverage: serde_json::Value =
            serde_json::from_slice(&fs::read(job_dir.join(COVERAGE_JSON)).unwrap()).unwrap();
        assert_eq!(coverage["percent"], 91.0);

        let stream = fs::read_to_string(dir.path().join(RESULTS_STREAM)).unwrap();
        assert_eq!(stream.lines().count(), 1);

        let report = collector.build_report(ReportOptions::default());
        report.write(dir.path()).unwrap();
        assert!(dir.path().join(REPORT_TEXT).exists());
        let summary: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(SUMMARY_JSON)).unwrap()).unwrap();
        assert_eq!(summary["totals"]["passed"], 1);
        assert_eq!(summary["groups"][0]["runtime"], "compiled");
    }

    #[test]
    fn rerun_without_coverage_removes_the_old_coverage_file() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("compiled/unit/gateway");

        let first = ResultCollector::persistent(dir.path()).unwrap();
        first.record(with_coverage(
            result(Runtime::Compiled, Category::Unit, "gateway", JobStatus::Passed),
            64.0,
        ));
        assert!(job_dir.join(COVERAGE_JSON).exists());

        let second = ResultCollector::persistent(dir.path()).unwrap();
        second.record(result(Runtime::Compiled, Category::Unit, "gateway", JobStatus::Passed));
        assert!(job_dir.join(RESULT_JSON).exists());
        assert!(!job_dir.join(COVERAGE_JSON).exists());
    }
}
