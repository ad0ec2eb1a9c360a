//! Integration tests for the results store and JUnit output

use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tickrun::collector::{BlockError, CapturedTest, RunReport, TestResultKind};
use tickrun::junit;
use tickrun::protocol::ResultStatus;
use tickrun::results::{read_failed_tests, write_results, ResultsFile};

fn report() -> RunReport {
    let test = |path: &str, result: TestResultKind, errors: &[&str]| CapturedTest {
        path: path.to_string(),
        result,
        duration: (result != TestResultKind::Skipped).then(|| Duration::from_millis(20)),
        logs: vec!["a log line".to_string()],
        errors: errors.iter().map(|e| e.to_string()).collect(),
    };
    RunReport {
        tests: vec![
            test("world > spawns", TestResultKind::Passed, &[]),
            test("world > despawns", TestResultKind::Failed, &["still alive"]),
            test("world > later", TestResultKind::Skipped, &[]),
            test("inventory > stacks", TestResultKind::Failed, &["off by one"]),
            test("inventory > sorts", TestResultKind::Todo, &[]),
        ],
        block_errors: vec![BlockError {
            path: "inventory".to_string(),
            errors: vec!["Error running afterAll hook: leak".to_string()],
        }],
        status: Some(ResultStatus::Failed),
        ..RunReport::default()
    }
}

#[test]
fn test_failed_paths_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".tickrun/test-results.json");
    let report = report();

    write_results(&report, "demo", &path).expect("Should write results");
    let failed = read_failed_tests(&path);

    let expected: BTreeSet<String> = report.failed_paths().into_iter().map(String::from).collect();
    assert_eq!(failed, expected);
    assert_eq!(failed.len(), 2);
}

#[test]
fn test_results_file_shape() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("results.json");
    write_results(&report(), "demo", &path).unwrap();

    let file: ResultsFile = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(file.name, "demo");
    assert_eq!(file.tests.len(), 5);
    assert_eq!(file.summary.failed, 2);
    assert_eq!(file.summary.describe_block_errors, 1);
    assert!(chrono::DateTime::parse_from_rfc3339(&file.timestamp).is_ok());

    let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let skipped = &raw["tests"][2];
    assert_eq!(skipped["result"], "skipped");
    assert!(skipped.get("duration").is_none());
    assert!(skipped.get("errors").is_none());
    let duration = raw["tests"][1]["duration"].as_f64().unwrap();
    assert!((duration - 20.0).abs() < 1e-6);
}

#[test]
fn test_junit_report_written() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reports/junit.xml");
    junit::write_report(&report(), "demo", &path).expect("Should write JUnit XML");

    let xml = fs::read_to_string(&path).unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<testsuites"));
    assert!(xml.contains("name=\"world\""));
    assert!(xml.contains("name=\"inventory\""));
    assert!(xml.contains("still alive"));
    assert!(xml.contains("<skipped"));
    assert!(xml.contains("afterAll hook: leak"));
}
