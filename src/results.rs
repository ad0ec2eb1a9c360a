//! Results Store
//!
//! Persists a subset of each [`RunReport`] so the next run can put
//! previously failed tests first.

use crate::collector::{RunReport, TestResultKind};
use crate::error::Result;
use crate::protocol::RunSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub path: String,
    pub result: TestResultKind,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsFile {
    /// RFC 3339
    pub timestamp: String,
    pub name: String,
    pub summary: RunSummary,
    pub tests: Vec<TestRecord>,
}

impl ResultsFile {
    pub fn from_report(report: &RunReport, name: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            name: name.to_string(),
            summary: report.summary(),
            tests: report
                .tests
                .iter()
                .map(|t| TestRecord {
                    path: t.path.clone(),
                    result: t.result,
                    duration: t.duration.map(|d| d.as_secs_f64() * 1000.0),
                    errors: t.errors.clone(),
                })
                .collect(),
        }
    }
}

/// Write the results file, creating its directory if needed
pub fn write_results(report: &RunReport, name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = ResultsFile::from_report(report, name);
    fs::write(path, serde_json::to_string_pretty(&file)?)?;
    tracing::debug!(path = %path.display(), tests = file.tests.len(), "results written");
    Ok(())
}

/// Paths that failed in the stored run. A missing or unreadable file
/// yields an empty set.
pub fn read_failed_tests(path: &Path) -> BTreeSet<String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("cannot read results file {}: {}", path.display(), e);
            }
            return BTreeSet::new();
        }
    };
    match serde_json::from_str::<ResultsFile>(&contents) {
        Ok(file) => file
            .tests
            .into_iter()
            .filter(|t| t.result == TestResultKind::Failed)
            .map(|t| t.path)
            .collect(),
        Err(e) => {
            tracing::warn!("ignoring malformed results file {}: {}", path.display(), e);
            BTreeSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CapturedTest;
    use std::time::Duration;
    use tempfile::TempDir;

    fn captured(path: &str, result: TestResultKind) -> CapturedTest {
        CapturedTest {
            path: path.to_string(),
            result,
            duration: None,
            logs: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let mut report = RunReport::default();
        report.tests.push(captured("a", TestResultKind::Skipped));
        let mut failed = captured("b", TestResultKind::Failed);
        failed.duration = Some(Duration::from_millis(3));
        failed.errors.push("x".to_string());
        report.tests.push(failed);

        let json = serde_json::to_value(ResultsFile::from_report(&report, "run")).unwrap();
        let tests = json["tests"].as_array().unwrap();
        assert!(tests[0].get("duration").is_none());
        assert!(tests[0].get("errors").is_none());
        assert_eq!(tests[1]["result"], "failed");
        assert_eq!(tests[1]["errors"][0], "x");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_missing_and_malformed_files_read_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_failed_tests(&dir.path().join("nope.json")).is_empty());
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(read_failed_tests(&bad).is_empty());
    }

    #[test]
    fn test_write_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/data/test-results.json");
        let mut report = RunReport::default();
        report.tests.push(captured("a", TestResultKind::Failed));
        write_results(&report, "run", &path).unwrap();
        assert_eq!(
            read_failed_tests(&path),
            BTreeSet::from(["a".to_string()])
        );
    }
}
