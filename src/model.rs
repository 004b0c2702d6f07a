//! Jobs and their results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime family a test job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Compiled,
    Interpreted,
    Browser,
}

impl Runtime {
    pub const ALL: [Runtime; 3] = [Runtime::Compiled, Runtime::Interpreted, Runtime::Browser];

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Compiled => "compiled",
            Runtime::Interpreted => "interpreted",
            Runtime::Browser => "browser",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compiled" | "go" => Ok(Runtime::Compiled),
            "interpreted" | "node" | "js" => Ok(Runtime::Interpreted),
            "browser" | "e2e-browser" | "playwright" => Ok(Runtime::Browser),
            other => Err(format!(
                "unknown runtime '{other}' (expected compiled, interpreted or browser)"
            )),
        }
    }
}

/// Test category of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Unit,
    Integration,
    E2e,
    Performance,
    Security,
    Contract,
    Smoke,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Unit,
        Category::Integration,
        Category::E2e,
        Category::Performance,
        Category::Security,
        Category::Contract,
        Category::Smoke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Unit => "unit",
            Category::Integration => "integration",
            Category::E2e => "e2e",
            Category::Performance => "performance",
            Category::Security => "security",
            Category::Contract => "contract",
            Category::Smoke => "smoke",
        }
    }

    /// Coverage is only meaningful for unit and integration suites.
    pub fn collects_coverage(&self) -> bool {
        matches!(self, Category::Unit | Category::Integration)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == lowered)
            .or(match lowered.as_str() {
                "perf" => Some(Category::Performance),
                "sec" => Some(Category::Security),
                _ => None,
            })
            .ok_or_else(|| format!("unknown test category '{lowered}'"))
    }
}

/// One scheduled unit of test execution. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub runtime: Runtime,
    pub category: Category,
    pub target: String,
    pub work_dir: PathBuf,
    /// Overrides the adapter's default test command.
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    /// Services that must be Healthy; otherwise the job is skipped.
    pub requires: Vec<String>,
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub collect_coverage: bool,
}

impl Job {
    pub fn new(runtime: Runtime, category: Category, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            id: Job::make_id(runtime, category, &target),
            runtime,
            category,
            target,
            work_dir: PathBuf::from("."),
            command: None,
            env: BTreeMap::new(),
            requires: Vec::new(),
            timeout: None,
            retries: 0,
            collect_coverage: category.collects_coverage(),
        }
    }

    pub fn make_id(runtime: Runtime, category: Category, slug: &str) -> String {
        format!("{runtime}/{category}/{slug}")
    }

    /// Last path segment of the id, used for the artifact directory.
    pub fn slug(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.target)
    }

    /// Replace the id's last segment.
    pub fn with_slug(mut self, slug: &str) -> Self {
        self.id = Job::make_id(self.runtime, self.category, slug);
        self
    }

    pub fn with_requires(mut self, services: &[&str]) -> Self {
        self.requires = services.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Passed,
    /// The tool ran and reported failing assertions.
    Failed,
    /// The tool could not be launched or crashed outside of assertions.
    Errored,
    Skipped,
    /// Stopped while in flight because the run was cancelled.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Passed => "passed",
            JobStatus::Failed => "failed",
            JobStatus::Errored => "errored",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this outcome makes the run exit non-zero.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Errored | JobStatus::Cancelled
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Errored)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u64,
    pub failed: u64,
    pub errored: u64,
    pub skipped: u64,
}

impl TestCounts {
    pub fn total(&self) -> u64 {
        self.passed + self.failed + self.errored + self.skipped
    }

    pub fn add(&mut self, other: &TestCounts) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.errored += other.errored;
        self.skipped += other.skipped;
    }
}

/// Outcome of a job. Written once by whoever resolved the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub runtime: Runtime,
    pub category: Category,
    pub target: String,
    pub status: JobStatus,
    pub duration_ms: u64,
    pub counts: TestCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl JobResult {
    pub fn new(job: &Job, status: JobStatus) -> Self {
        Self {
            job_id: job.id.clone(),
            runtime: job.runtime,
            category: job.category,
            target: job.target.clone(),
            status,
            duration_ms: 0,
            counts: TestCounts::default(),
            coverage: None,
            log_path: None,
            attempts: 0,
            note: None,
        }
    }

    pub fn skipped(job: &Job, reason: impl Into<String>) -> Self {
        Self::new(job, JobStatus::Skipped).with_note(reason)
    }

    pub fn errored(job: &Job, reason: impl Into<String>) -> Self {
        Self::new(job, JobStatus::Errored).with_note(reason)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn slug(&self) -> &str {
        self.job_id.rsplit('/').next().unwrap_or(&self.target)
    }
}
