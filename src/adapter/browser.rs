use super::{ParsedReport, TestAdapter, extract_json};
use crate::model::{Job, Runtime, TestCounts};
use serde::Deserialize;

/// Browser end-to-end suites, driven by Playwright's JSON reporter.
pub struct BrowserAdapter;

impl BrowserAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BrowserAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct PlaywrightReport {
    stats: PlaywrightStats,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlaywrightStats {
    expected: u64,
    unexpected: u64,
    flaky: u64,
    skipped: u64,
}

impl TestAdapter for BrowserAdapter {
    fn runtime(&self) -> Runtime {
        Runtime::Browser
    }

    fn display_name(&self) -> &'static str {
        "Browser (playwright)"
    }

    fn tool(&self) -> &'static str {
        "npx"
    }

    fn default_command(&self, _job: &Job) -> Vec<String> {
        ["npx", "playwright", "test", "--reporter=json"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn parse(&self, _job: &Job, stdout: &str) -> Option<ParsedReport> {
        parse_playwright(stdout)
    }
}

/// Flaky tests passed on retry and count as passed.
fn parse_playwright(stdout: &str) -> Option<ParsedReport> {
    let report: PlaywrightReport = serde_json::from_value(extract_json(stdout)?).ok()?;
    Some(ParsedReport {
        counts: TestCounts {
            passed: report.stats.expected + report.stats.flaky,
            failed: report.stats.unexpected,
            errored: 0,
            skipped: report.stats.skipped,
        },
        runtime_errors: report.errors.len() as u64,
        coverage: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stats_block() {
        let stdout = r#"{
  "config": {"workers": 2},
  "suites": [],
  "errors": [],
  "stats": {"startTime": "2026-01-01T00:00:00.000Z", "duration": 5120.5, "expected": 12, "skipped": 1, "unexpected": 2, "flaky": 1}
}
"#;
        let report = parse_playwright(stdout).unwrap();
        assert_eq!(report.counts.passed, 13);
        assert_eq!(report.counts.failed, 2);
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(report.runtime_errors, 0);
    }

    #[test]
    fn global_errors_count_as_runtime_errors() {
        let stdout = r#"{"stats":{"expected":0,"unexpected":0,"flaky":0,"skipped":0},"errors":[{"message":"webServer exited early"}]}"#;
        let report = parse_playwright(stdout).unwrap();
        assert_eq!(report.runtime_errors, 1);
    }

    #[test]
    fn plain_text_is_unparseable() {
        assert!(parse_playwright("Running 3 tests using 1 worker\n  3 passed\n").is_none());
    }
}
