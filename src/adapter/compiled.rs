use super::{ParsedReport, TestAdapter};
use crate::model::{Job, Runtime};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;

static COVERAGE_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"coverage: (\d+(?:\.\d+)?)% of statements").ok());

/// Go services, driven by `go test -json`.
pub struct CompiledAdapter;

impl CompiledAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompiledAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of the `go test -json` (test2json) event stream.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TestEvent {
    action: String,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    test: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

impl TestAdapter for CompiledAdapter {
    fn runtime(&self) -> Runtime {
        Runtime::Compiled
    }

    fn display_name(&self) -> &'static str {
        "Go (go test)"
    }

    fn tool(&self) -> &'static str {
        "go"
    }

    fn default_command(&self, job: &Job) -> Vec<String> {
        let mut argv = vec!["go".to_string(), "test".to_string(), "-json".to_string()];
        if job.collect_coverage {
            argv.push("-cover".to_string());
        }
        argv.push("./...".to_string());
        argv
    }

    fn parse(&self, _job: &Job, stdout: &str) -> Option<ParsedReport> {
        parse_test2json(stdout)
    }
}

/// Counts top-level tests only; subtests roll up into their parent.
fn parse_test2json(stdout: &str) -> Option<ParsedReport> {
    let mut report = ParsedReport::default();
    let mut seen_event = false;
    let mut failed_tests: HashMap<String, u64> = HashMap::new();
    let mut coverages = Vec::new();

    for line in stdout.lines() {
        let Ok(event) = serde_json::from_str::<TestEvent>(line.trim()) else {
            continue;
        };
        seen_event = true;
        let package = event.package.clone().unwrap_or_default();

        match (event.action.as_str(), event.test.as_deref()) {
            ("pass", Some(test)) if !test.contains('/') => report.counts.passed += 1,
            ("skip", Some(test)) if !test.contains('/') => report.counts.skipped += 1,
            ("fail", Some(test)) if !test.contains('/') => {
                report.counts.failed += 1;
                *failed_tests.entry(package).or_default() += 1;
            }
            // A package that failed without a failing test did not build or panicked in init.
            ("fail", None) if failed_tests.get(&package).copied().unwrap_or(0) == 0 => {
                report.runtime_errors += 1;
            }
            ("build-fail", _) => report.runtime_errors += 1,
            ("output", _) => {
                if let Some(percent) = event.output.as_deref().and_then(coverage_from_line) {
                    coverages.push(percent);
                }
            }
            _ => {}
        }
    }

    if !seen_event {
        return None;
    }
    if !coverages.is_empty() {
        report.coverage = Some(coverages.iter().sum::<f64>() / coverages.len() as f64);
    }
    Some(report)
}

fn coverage_from_line(line: &str) -> Option<f64> {
    let regex = COVERAGE_LINE.as_ref()?;
    regex.captures(line)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Category;

    const STREAM: &str = r#"{"Action":"start","Package":"example.com/gateway"}
{"Action":"run","Package":"example.com/gateway","Test":"TestRoute"}
{"Action":"pass","Package":"example.com/gateway","Test":"TestRoute","Elapsed":0.01}
{"Action":"run","Package":"example.com/gateway","Test":"TestAuth"}
{"Action":"run","Package":"example.com/gateway","Test":"TestAuth/expired"}
{"Action":"fail","Package":"example.com/gateway","Test":"TestAuth/expired","Elapsed":0}
{"Action":"fail","Package":"example.com/gateway","Test":"TestAuth","Elapsed":0}
{"Action":"skip","Package":"example.com/gateway","Test":"TestSlow","Elapsed":0}
{"Action":"output","Package":"example.com/gateway","Output":"coverage: 70.0% of statements\n"}
{"Action":"fail","Package":"example.com/gateway","Elapsed":0.2}
{"Action":"output","Package":"example.com/billing","Output":"coverage: 80.0% of statements\n"}
{"Action":"pass","Package":"example.com/billing","Elapsed":0.1}
"#;

    #[test]
    fn parses_counts_and_average_coverage() {
        let report = parse_test2json(STREAM).unwrap();
        assert_eq!(report.counts.passed, 1);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.skipped, 1);
        assert_eq!(report.runtime_errors, 0);
        assert_eq!(report.coverage, Some(75.0));
    }

    #[test]
    fn package_failure_without_tests_is_a_runtime_error() {
        let stream = r##"{"Action":"output","Package":"example.com/broken","Output":"# example.com/broken\n"}
{"Action":"fail","Package":"example.com/broken","Elapsed":0}
"##;
        let report = parse_test2json(stream).unwrap();
        assert_eq!(report.runtime_errors, 1);
        assert_eq!(report.counts.total(), 0);
    }

    #[test]
    fn non_json_output_is_unparseable() {
        assert!(parse_test2json("ok  \texample.com/gateway\t0.2s\n").is_none());
    }

    #[test]
    fn default_command_adds_cover_for_unit_jobs() {
        let adapter = CompiledAdapter::new();
        let unit = Job::new(Runtime::Compiled, Category::Unit, "gateway");
        assert_eq!(
            adapter.default_command(&unit),
            vec!["go", "test", "-json", "-cover", "./..."]
        );
        let e2e = Job::new(Runtime::Compiled, Category::E2e, "gateway");
        assert!(!adapter.default_command(&e2e).contains(&"-cover".to_string()));
    }
}
