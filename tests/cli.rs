use std::fs;
use std::path::Path;

use predicates::prelude::*;
use tempfile::TempDir;

fn stackrun_binary() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("stackrun").expect("binary built");
    cmd.env_remove("STACKRUN_CONCURRENCY")
        .env_remove("STACKRUN_RESULTS_DIR")
        .env("STACKRUN_LOG", "warn");
    cmd
}

fn project(config: &str) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("stackrun.toml"), config).expect("write config");
    dir
}

fn summary(dir: &Path) -> serde_json::Value {
    let raw = fs::read_to_string(dir.join("test-results").join("summary.json")).expect("summary");
    serde_json::from_str(&raw).expect("summary is json")
}

const SETTINGS: &str = r#"
[settings]
max_concurrency = 2
grace_period_secs = 1
poll_interval_secs = 1
liveness_interval_secs = 0
"#;

#[test]
fn version_flag_prints_name() {
    stackrun_binary()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("stackrun "));
}

#[test]
fn check_lists_every_runtime() {
    stackrun_binary()
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("compiled"))
        .stdout(predicate::str::contains("interpreted"))
        .stdout(predicate::str::contains("browser"));
}

#[test]
fn plan_prints_waves_in_dependency_order() {
    let dir = project(&format!(
        "{SETTINGS}
[services.db]
[services.cache]
[services.gateway]
depends_on = [\"db\", \"cache\"]

[[jobs]]
runtime = \"compiled\"
category = \"unit\"
target = \"gateway\"
requires = [\"gateway\"]
"
    ));

    stackrun_binary()
        .current_dir(dir.path())
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("1: db [external, none], cache [external, none]"))
        .stdout(predicate::str::contains("2: gateway"))
        .stdout(predicate::str::contains("compiled/unit/gateway"));
}

#[test]
fn dependency_cycle_exits_with_two() {
    let dir = project(
        r#"
[services.a]
depends_on = ["b"]
[services.b]
depends_on = ["a"]
"#,
    );

    stackrun_binary()
        .current_dir(dir.path())
        .arg("run")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
    assert!(!dir.path().join("test-results").exists());
}

#[test]
fn missing_configuration_exits_with_two() {
    let dir = tempfile::tempdir().unwrap();
    stackrun_binary()
        .current_dir(dir.path())
        .args(["run", "--config", "nope.toml"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn invalid_concurrency_from_environment_exits_with_two() {
    let dir = project(SETTINGS);
    stackrun_binary()
        .current_dir(dir.path())
        .env("STACKRUN_CONCURRENCY", "0")
        .arg("plan")
        .assert()
        .code(2);
}

#[cfg(unix)]
mod unix {
    use super::*;

    #[test]
    fn passing_run_writes_the_artifact_tree() {
        let dir = project(&format!(
            "{SETTINGS}
[services.api]
command = \"sleep 30\"
readiness = {{ command = \"true\" }}

[[jobs]]
runtime = \"compiled\"
category = \"unit\"
target = \"api\"
command = \"sh -c 'echo unit ok'\"
requires = [\"api\"]

[[jobs]]
runtime = \"interpreted\"
category = \"integration\"
target = \"billing\"
command = \"sh -c 'echo integration ok'\"
"
        ));

        stackrun_binary()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .success()
            .stdout(predicate::str::contains("Test run PASSED"));

        let results = dir.path().join("test-results");
        for file in [
            "report.txt",
            "summary.json",
            "results.jsonl",
            "compiled/unit/api/output.log",
            "compiled/unit/api/result.json",
            "interpreted/integration/billing/output.log",
        ] {
            assert!(results.join(file).is_file(), "missing {file}");
        }
        let log = fs::read_to_string(results.join("compiled/unit/api/output.log")).unwrap();
        assert!(log.contains("unit ok"));

        let summary = summary(dir.path());
        assert_eq!(summary["totals"]["passed"], 2);
        assert_eq!(summary["services"][0]["state"], "healthy");
    }

    #[test]
    fn coverage_below_threshold_fails_a_green_run() {
        let dir = project(&format!(
            r#"{SETTINGS}
coverage_threshold = 80

[[jobs]]
runtime = "compiled"
category = "unit"
target = "gateway"
command = ["sh", "-c", '''printf '%s\n' '{{"Action":"pass","Package":"p","Test":"TestA"}}' '{{"Action":"output","Package":"p","Output":"coverage: 72.0% of statements"}}' ''']
"#
        ));

        stackrun_binary()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("NOT MET"));

        let summary = summary(dir.path());
        assert_eq!(summary["totals"]["passed"], 1);
        assert_eq!(summary["coverage"], 72.0);
        assert_eq!(summary["threshold_met"], false);
        let coverage = fs::read_to_string(
            dir.path()
                .join("test-results/compiled/unit/gateway/coverage.json"),
        )
        .unwrap();
        assert!(coverage.contains("72"));
    }

    #[test]
    fn failing_job_exits_with_one_and_skips_do_not() {
        let dir = project(&format!(
            "{SETTINGS}
[services.db]
command = \"sleep 30\"

[[jobs]]
runtime = \"compiled\"
category = \"unit\"
target = \"broken\"
command = \"sh -c 'exit 1'\"

[[jobs]]
runtime = \"compiled\"
category = \"unit\"
target = \"fine\"
command = \"true\"
"
        ));

        stackrun_binary()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Failed jobs:"))
            .stdout(predicate::str::contains("compiled/unit/broken"));

        stackrun_binary()
            .current_dir(dir.path())
            .args(["run", "--target", "fine"])
            .assert()
            .success();
    }

    #[test]
    fn unhealthy_service_exits_with_three_and_runs_nothing() {
        let dir = project(&format!(
            "{SETTINGS}
[services.db]
command = \"sleep 30\"
readiness = {{ command = \"false\" }}
startup_timeout_secs = 1

[[jobs]]
runtime = \"compiled\"
category = \"unit\"
target = \"api\"
command = \"touch ran\"
"
        ));

        stackrun_binary()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(3)
            .stdout(predicate::str::contains("ABORTED"));
        assert!(!dir.path().join("ran").exists());
        assert_eq!(summary(dir.path())["totals"]["skipped"], 1);
    }

    #[test]
    fn global_timeout_is_reported_as_cancelled() {
        let dir = project(&format!(
            "{SETTINGS}
[[jobs]]
runtime = \"compiled\"
category = \"unit\"
target = \"hang\"
command = \"sleep 30\"
"
        ));

        stackrun_binary()
            .current_dir(dir.path())
            .args(["run", "--timeout", "1"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("CANCELLED"));
    }
}
