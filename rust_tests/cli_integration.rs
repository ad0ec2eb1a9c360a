//! End-to-end tests: the `tickrun` binary supervising the demo host

use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use wait_timeout::ChildExt;

const TICKRUN: &str = env!("CARGO_BIN_EXE_tickrun");
const DEMO_HOST: &str = env!("CARGO_BIN_EXE_demo_host");

/// Run `tickrun <args> -- demo_host` inside `dir`, killing it after 60s
fn run_tickrun(dir: &Path, args: &[&str], fail: bool) -> Output {
    let mut command = Command::new(TICKRUN);
    command
        .current_dir(dir)
        .args(args)
        .args(["--output-timeout", "30", "--", DEMO_HOST])
        .env("TICKRUN_STATE_DIR", dir.join("state"))
        .env_remove("TICKRUN_FORMAT")
        .env_remove("TICKRUN_JUNIT_XML")
        .env_remove("TICKRUN_CONFIG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if fail {
        command.env("DEMO_HOST_FAIL", "1");
    } else {
        command.env_remove("DEMO_HOST_FAIL");
    }

    let mut child = command.spawn().expect("Failed to spawn tickrun");
    match child
        .wait_timeout(Duration::from_secs(60))
        .expect("Failed to wait on tickrun")
    {
        Some(_) => child.wait_with_output().expect("Failed to collect output"),
        None => {
            let _ = child.kill();
            panic!("tickrun did not finish within 60s");
        }
    }
}

fn results_json(dir: &Path) -> serde_json::Value {
    let text = fs::read_to_string(dir.join(".tickrun/test-results.json"))
        .expect("Results file should exist");
    serde_json::from_str(&text).expect("Results file should be JSON")
}

#[test]
fn test_passing_run_exits_zero() {
    let dir = TempDir::new().unwrap();
    let output = run_tickrun(dir.path(), &[], false);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "tickrun failed:\n{stderr}");

    let results = results_json(dir.path());
    let tests = results["tests"].as_array().unwrap();
    assert!(tests.iter().any(|t| t["path"] == "world > survives reload" && t["result"] == "passed"));
    assert!(tests.iter().any(|t| t["path"] == "basics > TODO" && t["result"] == "todo"));
    assert!(tests.iter().all(|t| t["result"] != "failed"));
}

#[test]
fn test_failing_run_exits_nonzero_and_records_failure() {
    let dir = TempDir::new().unwrap();
    let output = run_tickrun(dir.path(), &[], true);
    assert!(!output.status.success());

    let results = results_json(dir.path());
    let failed: Vec<&str> = results["tests"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["result"] == "failed")
        .filter_map(|t| t["path"].as_str())
        .collect();
    assert_eq!(failed, vec!["basics > Fails"]);
    assert_eq!(results["summary"]["failed"], 1);
}

#[test]
fn test_json_format_writes_only_ndjson_to_stdout() {
    let dir = TempDir::new().unwrap();
    let output = run_tickrun(dir.path(), &["--format", "json"], false);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let events: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("Every stdout line is JSON"))
        .collect();
    assert!(events.iter().any(|e| e["event"] == "run_start"));
    assert_eq!(events.last().map(|e| e["event"].clone()), Some("result".into()));
}

#[test]
fn test_junit_report_is_written() {
    let dir = TempDir::new().unwrap();
    let junit = dir.path().join("out/junit.xml");
    let output = run_tickrun(dir.path(), &["--junit-xml", junit.to_str().unwrap()], true);
    assert!(!output.status.success());

    let xml = fs::read_to_string(&junit).expect("JUnit report should exist");
    assert!(xml.contains("name=\"basics\""));
    assert!(xml.contains("intentional failure"));
}
