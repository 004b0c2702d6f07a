use super::{ParsedReport, TestAdapter, extract_json};
use crate::model::{Job, Runtime, TestCounts};
use serde::Deserialize;
use std::path::PathBuf;

const COVERAGE_SUMMARY: &str = "coverage/coverage-summary.json";

/// Node services, driven by Jest's `--json` report.
pub struct InterpretedAdapter;

impl InterpretedAdapter {
    pub fn new() -> Self {
        Self
    }

    fn summary_path(job: &Job) -> PathBuf {
        job.work_dir.join(COVERAGE_SUMMARY)
    }
}

impl Default for InterpretedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JestReport {
    num_passed_tests: u64,
    num_failed_tests: u64,
    num_pending_tests: u64,
    num_todo_tests: u64,
    num_runtime_error_test_suites: u64,
}

#[derive(Debug, Deserialize)]
struct CoverageSummary {
    total: CoverageTotals,
}

#[derive(Debug, Deserialize)]
struct CoverageTotals {
    lines: CoverageMetric,
}

#[derive(Debug, Deserialize)]
struct CoverageMetric {
    pct: f64,
}

impl TestAdapter for InterpretedAdapter {
    fn runtime(&self) -> Runtime {
        Runtime::Interpreted
    }

    fn display_name(&self) -> &'static str {
        "Node (jest)"
    }

    fn tool(&self) -> &'static str {
        "npx"
    }

    fn default_command(&self, job: &Job) -> Vec<String> {
        let mut argv: Vec<String> = ["npx", "jest", "--ci", "--json"]
            .into_iter()
            .map(String::from)
            .collect();
        if job.collect_coverage {
            argv.push("--coverage".to_string());
            argv.push("--coverageReporters=json-summary".to_string());
        }
        argv
    }

    fn prepare(&self, job: &Job) -> std::io::Result<()> {
        match std::fs::remove_file(Self::summary_path(job)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    fn parse(&self, job: &Job, stdout: &str) -> Option<ParsedReport> {
        let mut report = parse_jest(stdout)?;
        if job.collect_coverage {
            report.coverage = std::fs::read_to_string(Self::summary_path(job))
                .ok()
                .and_then(|text| coverage_from_summary(&text));
        }
        Some(report)
    }
}

fn parse_jest(stdout: &str) -> Option<ParsedReport> {
    let value = extract_json(stdout)?;
    value.get("numTotalTests")?;
    let jest: JestReport = serde_json::from_value(value).ok()?;
    Some(ParsedReport {
        counts: TestCounts {
            passed: jest.num_passed_tests,
            failed: jest.num_failed_tests,
            errored: 0,
            skipped: jest.num_pending_tests + jest.num_todo_tests,
        },
        runtime_errors: jest.num_runtime_error_test_suites,
        coverage: None,
    })
}

fn coverage_from_summary(text: &str) -> Option<f64> {
    let summary: CoverageSummary = serde_json::from_str(text).ok()?;
    Some(summary.total.lines.pct)
}
