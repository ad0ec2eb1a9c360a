//! JUnit XML Report for CI Integration
//!
//! Generates JUnit-compatible XML from a finished [`RunReport`]. Each
//! top-level definition source becomes one `<testsuite>`.

use crate::collector::{RunReport, TestResultKind};
use crate::error::{Error, Result};
use crate::tree::PATH_SEPARATOR;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Strip ANSI color codes and NUL bytes, neither of which XML accepts
fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if c != '\0' {
            result.push(c);
        }
    }
    result
}

// =============================================================================
// XML Schema Structs (JUnit Format)
// =============================================================================

#[derive(Serialize)]
#[serde(rename = "testsuites")]
struct TestSuites {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@errors")]
    errors: usize,
    #[serde(rename = "testsuite")]
    suites: Vec<TestSuite>,
}

#[derive(Serialize, Default)]
struct TestSuite {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@errors")]
    errors: usize,
    #[serde(rename = "@skipped")]
    skipped: usize,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(rename = "testcase")]
    cases: Vec<TestCase>,
}

#[derive(Serialize)]
struct TestCase {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@classname")]
    classname: String,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<Skipped>,
    #[serde(rename = "system-out", skip_serializing_if = "Option::is_none")]
    system_out: Option<String>,
}

#[derive(Serialize)]
struct Failure {
    #[serde(rename = "@message")]
    message: String,
    #[serde(rename = "$text")]
    body: String,
}

#[derive(Serialize)]
struct Skipped {
    #[serde(rename = "@message")]
    message: String,
}

/// "a > b > c" -> ("a > b", "c"); a top-level name is its own class
fn split_path(path: &str) -> (String, String) {
    match path.rsplit_once(PATH_SEPARATOR) {
        Some((class, name)) => (class.to_string(), name.to_string()),
        None => (path.to_string(), path.to_string()),
    }
}

fn suite_name(path: &str) -> &str {
    path.split(PATH_SEPARATOR).next().unwrap_or(path)
}

fn build(report: &RunReport, name: &str) -> TestSuites {
    let mut suites: BTreeMap<String, TestSuite> = BTreeMap::new();

    for test in &report.tests {
        let suite_key = suite_name(&test.path).to_string();
        let suite = suites.entry(suite_key.clone()).or_insert_with(|| TestSuite {
            name: suite_key,
            ..TestSuite::default()
        });
        let (classname, case_name) = split_path(&test.path);
        let time = test.duration.map_or(0.0, |d| d.as_secs_f64());

        let mut case = TestCase {
            name: case_name,
            classname,
            time,
            failure: None,
            error: None,
            skipped: None,
            system_out: None,
        };
        match test.result {
            TestResultKind::Passed => {}
            TestResultKind::Failed => {
                suite.failures += 1;
                let body = strip_ansi_codes(&test.errors.join("\n"));
                let message = body.lines().next().unwrap_or("Test failed").to_string();
                case.failure = Some(Failure { message, body });
                if !test.logs.is_empty() {
                    case.system_out = Some(strip_ansi_codes(&test.logs.join("\n")));
                }
            }
            TestResultKind::Skipped | TestResultKind::Todo => {
                suite.skipped += 1;
                let message = if test.result == TestResultKind::Todo { "todo" } else { "skipped" };
                case.skipped = Some(Skipped {
                    message: message.to_string(),
                });
            }
        }
        suite.tests += 1;
        suite.time += time;
        suite.cases.push(case);
    }

    for block in &report.block_errors {
        let suite_key = suite_name(&block.path).to_string();
        let suite = suites.entry(suite_key.clone()).or_insert_with(|| TestSuite {
            name: suite_key,
            ..TestSuite::default()
        });
        let body = strip_ansi_codes(&block.errors.join("\n"));
        suite.errors += 1;
        suite.tests += 1;
        suite.cases.push(TestCase {
            name: "(describe block)".to_string(),
            classname: block.path.clone(),
            time: 0.0,
            failure: None,
            error: Some(Failure {
                message: body.lines().next().unwrap_or("Describe block failed").to_string(),
                body,
            }),
            skipped: None,
            system_out: None,
        });
    }

    if let Some(error) = &report.load_error {
        suites.insert(
            "(load error)".to_string(),
            TestSuite {
                name: "(load error)".to_string(),
                tests: 1,
                errors: 1,
                cases: vec![TestCase {
                    name: "load".to_string(),
                    classname: name.to_string(),
                    time: 0.0,
                    failure: None,
                    error: Some(Failure {
                        message: "Load error".to_string(),
                        body: strip_ansi_codes(error),
                    }),
                    skipped: None,
                    system_out: None,
                }],
                ..TestSuite::default()
            },
        );
    }

    let suites: Vec<TestSuite> = suites.into_values().collect();
    TestSuites {
        name: name.to_string(),
        tests: suites.iter().map(|s| s.tests).sum(),
        failures: suites.iter().map(|s| s.failures).sum(),
        errors: suites.iter().map(|s| s.errors).sum(),
        suites,
    }
}

/// Render a report as JUnit XML
pub fn render(report: &RunReport, name: &str) -> Result<String> {
    let xml = quick_xml::se::to_string(&build(report, name))
        .map_err(|e| Error::Internal(format!("JUnit serialization failed: {e}")))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{xml}"))
}

/// Write a report as JUnit XML to `path`
pub fn write_report(report: &RunReport, name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render(report, name)?)?;
    tracing::info!("JUnit report written to {}", path.display());
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
