//! Run Collector
//!
//! Rebuilds a structured [`RunReport`] from the decoded host stream.

use crate::protocol::{DecodedLine, ResultStatus, RunSummary, TestRunnerEvent};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestResultKind {
    Passed,
    Failed,
    Skipped,
    Todo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedTest {
    pub path: String,
    pub result: TestResultKind,
    pub duration: Option<Duration>,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockError {
    pub path: String,
    pub errors: Vec<String>,
}

/// Append-only record of one run; finalized by the result line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub tests: Vec<CapturedTest>,
    pub block_errors: Vec<BlockError>,
    /// Counts as reported by the host in `runFinished`
    pub summary: Option<RunSummary>,
    pub status: Option<ResultStatus>,
    pub focused: bool,
    /// Logs seen outside any test
    pub orphan_logs: Vec<String>,
    pub load_error: Option<String>,
}

impl RunReport {
    pub fn failed_paths(&self) -> Vec<&str> {
        self.tests
            .iter()
            .filter(|t| t.result == TestResultKind::Failed)
            .map(|t| t.path.as_str())
            .collect()
    }

    pub fn count(&self, kind: TestResultKind) -> u32 {
        self.tests.iter().filter(|t| t.result == kind).count() as u32
    }

    /// Host summary if one arrived, otherwise counted from captured tests
    pub fn summary(&self) -> RunSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        let passed = self.count(TestResultKind::Passed);
        let failed = self.count(TestResultKind::Failed);
        RunSummary {
            ran: passed + failed,
            passed,
            failed,
            skipped: self.count(TestResultKind::Skipped),
            todo: self.count(TestResultKind::Todo),
            cancelled: 0,
            describe_block_errors: self.block_errors.len() as u32,
            status: self.status,
            has_focused_tests: self.focused,
        }
    }
}

#[derive(Debug)]
struct OpenTest {
    path: String,
    started: Instant,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RunCollector {
    report: RunReport,
    open: Option<OpenTest>,
    /// Test entered but not yet started
    pending: Option<(String, Vec<String>)>,
}

impl RunCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn is_finished(&self) -> bool {
        self.report.status.is_some()
    }

    pub fn handle(&mut self, line: &DecodedLine) {
        match line {
            DecodedLine::Event(event) => self.on_event(event),
            DecodedLine::Log(text) => self.on_log(text.clone()),
            DecodedLine::Message(message) => self.on_log(message.text()),
            DecodedLine::Result { status, focused } => {
                self.report.status = Some(*status);
                self.report.focused = *focused;
            }
        }
    }

    pub fn on_log(&mut self, text: String) {
        if let Some(open) = self.open.as_mut() {
            open.logs.push(text);
        } else if let Some((_, logs)) = self.pending.as_mut() {
            logs.push(text);
        } else {
            self.report.orphan_logs.push(text);
        }
    }

    pub fn on_event(&mut self, event: &TestRunnerEvent) {
        match event {
            TestRunnerEvent::TestEntered { test } => {
                self.flush_pending();
                self.pending = Some((test.path.clone(), Vec::new()));
            }
            TestRunnerEvent::TestStarted { test } => {
                let logs = self.take_pending(&test.path);
                self.open = Some(OpenTest {
                    path: test.path.clone(),
                    started: Instant::now(),
                    logs,
                });
            }
            TestRunnerEvent::TestPassed { test } => {
                self.close(&test.path, TestResultKind::Passed, test.duration_ms, Vec::new());
            }
            TestRunnerEvent::TestFailed { test, errors } => {
                self.close(&test.path, TestResultKind::Failed, test.duration_ms, errors.clone());
            }
            TestRunnerEvent::TestSkipped { test } => {
                self.record_unstarted(&test.path, TestResultKind::Skipped);
            }
            TestRunnerEvent::TestTodo { test } => {
                self.record_unstarted(&test.path, TestResultKind::Todo);
            }
            TestRunnerEvent::DescribeBlockFailed { block, errors } => {
                self.report.block_errors.push(BlockError {
                    path: block.path.clone(),
                    errors: errors.clone(),
                });
            }
            TestRunnerEvent::RunFinished { results } => {
                self.report.summary = Some(results.clone());
            }
            TestRunnerEvent::RunCancelled => self.abandon_open(),
            TestRunnerEvent::LoadError { error } => {
                self.report.load_error = Some(error.clone());
            }
            TestRunnerEvent::RunStarted
            | TestRunnerEvent::DescribeBlockEntered { .. }
            | TestRunnerEvent::DescribeBlockFinished { .. } => {}
        }
    }

    /// Finalize, moving logs of anything still open to the orphan list
    pub fn finish(mut self) -> RunReport {
        self.abandon_open();
        self.flush_pending();
        self.report
    }

    fn take_pending(&mut self, path: &str) -> Vec<String> {
        match self.pending.take() {
            Some((pending, logs)) if pending == path => logs,
            Some((_, logs)) => {
                self.report.orphan_logs.extend(logs);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn flush_pending(&mut self) {
        if let Some((_, logs)) = self.pending.take() {
            self.report.orphan_logs.extend(logs);
        }
    }

    fn abandon_open(&mut self) {
        if let Some(open) = self.open.take() {
            self.report.orphan_logs.extend(open.logs);
        }
    }

    fn close(
        &mut self,
        path: &str,
        result: TestResultKind,
        reported_ms: Option<f64>,
        errors: Vec<String>,
    ) {
        let (logs, timer) = match self.open.take() {
            Some(open) if open.path == path => (open.logs, Some(open.started.elapsed())),
            Some(other) => {
                self.report.orphan_logs.extend(other.logs);
                (Vec::new(), None)
            }
            None => (self.take_pending(path), None),
        };
        let duration = reported_ms
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
            .or(timer);
        self.report.tests.push(CapturedTest {
            path: path.to_string(),
            result,
            duration,
            logs,
            errors,
        });
    }

    fn record_unstarted(&mut self, path: &str, result: TestResultKind) {
        let logs = self.take_pending(path);
        self.report.tests.push(CapturedTest {
            path: path.to_string(),
            result,
            duration: None,
            logs,
            errors: Vec::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TestInfo;

    fn info(path: &str) -> TestInfo {
        TestInfo {
            path: path.to_string(),
            source: None,
            tags: Vec::new(),
            duration_ms: None,
        }
    }

    fn event(collector: &mut RunCollector, event: TestRunnerEvent) {
        collector.handle(&DecodedLine::Event(event));
    }

    fn log(collector: &mut RunCollector, text: &str) {
        collector.handle(&DecodedLine::Log(text.to_string()));
    }

    #[test]
    fn test_logs_attach_to_running_test() {
        let mut c = RunCollector::new();
        log(&mut c, "before");
        event(&mut c, TestRunnerEvent::TestEntered { test: info("a") });
        log(&mut c, "entering");
        event(&mut c, TestRunnerEvent::TestStarted { test: info("a") });
        log(&mut c, "inside");
        event(
            &mut c,
            TestRunnerEvent::TestFailed {
                test: info("a"),
                errors: vec!["bad".to_string()],
            },
        );
        log(&mut c, "after");

        let report = c.finish();
        assert_eq!(report.tests.len(), 1);
        let test = &report.tests[0];
        assert_eq!(test.result, TestResultKind::Failed);
        assert_eq!(test.logs, vec!["entering", "inside"]);
        assert_eq!(test.errors, vec!["bad"]);
        assert!(test.duration.is_some());
        assert_eq!(report.orphan_logs, vec!["before", "after"]);
    }

    #[test]
    fn test_skipped_and_todo_have_no_duration() {
        let mut c = RunCollector::new();
        event(&mut c, TestRunnerEvent::TestEntered { test: info("s") });
        event(&mut c, TestRunnerEvent::TestSkipped { test: info("s") });
        event(&mut c, TestRunnerEvent::TestEntered { test: info("t") });
        event(&mut c, TestRunnerEvent::TestTodo { test: info("t") });
        let report = c.finish();
        assert_eq!(report.count(TestResultKind::Skipped), 1);
        assert_eq!(report.count(TestResultKind::Todo), 1);
        assert!(report.tests.iter().all(|t| t.duration.is_none()));
    }

    #[test]
    fn test_host_duration_preferred() {
        let mut c = RunCollector::new();
        event(&mut c, TestRunnerEvent::TestStarted { test: info("a") });
        let mut finished = info("a");
        finished.duration_ms = Some(250.0);
        event(&mut c, TestRunnerEvent::TestPassed { test: finished });
        let report = c.finish();
        assert_eq!(report.tests[0].duration, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_result_line_finalizes() {
        let mut c = RunCollector::new();
        assert!(!c.is_finished());
        c.handle(&DecodedLine::Result {
            status: ResultStatus::Todo,
            focused: true,
        });
        assert!(c.is_finished());
        let report = c.finish();
        assert_eq!(report.status, Some(ResultStatus::Todo));
        assert!(report.focused);
        assert!(report.summary().has_focused_tests);
    }

    #[test]
    fn test_block_failures_recorded() {
        let mut c = RunCollector::new();
        event(
            &mut c,
            TestRunnerEvent::DescribeBlockFailed {
                block: crate::protocol::BlockInfo {
                    path: "f > b".to_string(),
                    source: None,
                },
                errors: vec!["hook".to_string()],
            },
        );
        assert_eq!(c.finish().summary().describe_block_errors, 1);
    }
}
