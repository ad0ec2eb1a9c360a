//! Reporter Module: console output for Human (CLI) and Machine (JSON) formats
//!
//! - `Reporter` trait receives the decoded host stream
//! - `JsonReporter` outputs NDJSON to stdout (for --format=json)
//! - `HumanReporter` outputs human-readable text to stderr
//!
//! When JsonReporter is active, ONLY valid JSON goes to stdout.
//! All other output (logs, errors, verbose mirroring) goes to stderr.

use crate::protocol::{ResultStatus, RunSummary, TestInfo, TestRunnerEvent};
use serde::Serialize;
use std::io::{self, Write};

/// Machine-readable events for JSON output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MachineEvent<'a> {
    RunStart,
    TestStart {
        path: &'a str,
    },
    TestFinished {
        path: &'a str,
        status: &'a str, // "pass", "fail", "skip", "todo"
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<f64>,
        #[serde(skip_serializing_if = "no_errors")]
        errors: &'a [String],
    },
    BlockFailed {
        path: &'a str,
        errors: &'a [String],
    },
    Log {
        text: &'a str,
    },
    RunFinished {
        summary: &'a RunSummary,
    },
    Result {
        status: ResultStatus,
        focused: bool,
    },
    /// Emitted on fatal supervisor errors
    Error {
        message: &'a str,
    },
}

const NO_ERRORS: &[String] = &[];

fn no_errors(errors: &&[String]) -> bool {
    errors.is_empty()
}

/// Reporter trait for output abstraction
pub trait Reporter {
    /// Called for every structured event from the host
    fn on_event(&mut self, event: &TestRunnerEvent);

    /// Called for plain log lines and message blocks
    fn on_log(&mut self, text: &str);

    /// Called once when the result line arrives
    fn on_result(&mut self, status: ResultStatus, focused: bool);

    /// Called on fatal supervisor errors
    fn on_error(&mut self, message: &str);
}

// =============================================================================
// JsonReporter
// =============================================================================

/// JSON Reporter - outputs NDJSON to stdout
pub struct JsonReporter {
    out: Box<dyn Write>,
}

impl Default for JsonReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonReporter {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write>) -> Self {
        Self { out }
    }

    fn emit(&mut self, event: &MachineEvent<'_>) {
        let written = serde_json::to_string(event)
            .map_err(io::Error::from)
            .and_then(|line| writeln!(self.out, "{line}"));
        if let Err(e) = written {
            tracing::warn!("failed to write JSON event: {}", e);
        }
    }
}

fn finished<'a>(test: &'a TestInfo, status: &'a str, errors: &'a [String]) -> MachineEvent<'a> {
    MachineEvent::TestFinished {
        path: &test.path,
        status,
        duration_ms: test.duration_ms,
        errors,
    }
}

impl Reporter for JsonReporter {
    fn on_event(&mut self, event: &TestRunnerEvent) {
        let machine = match event {
            TestRunnerEvent::RunStarted => MachineEvent::RunStart,
            TestRunnerEvent::TestStarted { test } => MachineEvent::TestStart { path: &test.path },
            TestRunnerEvent::TestPassed { test } => finished(test, "pass", NO_ERRORS),
            TestRunnerEvent::TestFailed { test, errors } => finished(test, "fail", errors),
            TestRunnerEvent::TestSkipped { test } => finished(test, "skip", NO_ERRORS),
            TestRunnerEvent::TestTodo { test } => finished(test, "todo", NO_ERRORS),
            TestRunnerEvent::DescribeBlockFailed { block, errors } => MachineEvent::BlockFailed {
                path: &block.path,
                errors,
            },
            TestRunnerEvent::RunFinished { results } => MachineEvent::RunFinished { summary: results },
            TestRunnerEvent::LoadError { error } => MachineEvent::Error { message: error },
            _ => return,
        };
        self.emit(&machine);
    }

    fn on_log(&mut self, text: &str) {
        self.emit(&MachineEvent::Log { text });
    }

    fn on_result(&mut self, status: ResultStatus, focused: bool) {
        self.emit(&MachineEvent::Result { status, focused });
    }

    fn on_error(&mut self, message: &str) {
        self.emit(&MachineEvent::Error { message });
    }
}

// =============================================================================
// HumanReporter
// =============================================================================

/// Human Reporter - outputs readable text to stderr. Logs of a test are
/// held back and only shown if it fails.
pub struct HumanReporter {
    out: Box<dyn Write>,
    in_test: bool,
    buffered: Vec<String>,
}

impl Default for HumanReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl HumanReporter {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stderr()))
    }

    pub fn with_writer(out: Box<dyn Write>) -> Self {
        Self {
            out,
            in_test: false,
            buffered: Vec::new(),
        }
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }

    fn indented(&mut self, lines: &[String]) {
        for text in lines {
            for line in text.lines().take(20) {
                self.line(&format!("    {line}"));
            }
        }
    }
}

fn millis(test: &TestInfo) -> String {
    test.duration_ms
        .map(|ms| format!(" ({ms:.0}ms)"))
        .unwrap_or_default()
}

impl Reporter for HumanReporter {
    fn on_event(&mut self, event: &TestRunnerEvent) {
        match event {
            TestRunnerEvent::RunStarted => self.line("[tickrun] Running tests...\n"),
            TestRunnerEvent::TestStarted { .. } => {
                self.in_test = true;
                self.buffered.clear();
            }
            TestRunnerEvent::TestPassed { test } => {
                self.in_test = false;
                self.line(&format!("  ✓ {}{}", test.path, millis(test)));
            }
            TestRunnerEvent::TestFailed { test, errors } => {
                self.in_test = false;
                self.line(&format!("  ✗ {}{}", test.path, millis(test)));
                self.indented(errors);
                let logs = std::mem::take(&mut self.buffered);
                if !logs.is_empty() {
                    self.line("    --- output ---");
                    self.indented(&logs);
                }
            }
            TestRunnerEvent::TestSkipped { test } => {
                self.line(&format!("  ⊘ {} skipped", test.path));
            }
            TestRunnerEvent::TestTodo { test } => self.line(&format!("  … {} todo", test.path)),
            TestRunnerEvent::DescribeBlockFailed { block, errors } => {
                self.line(&format!("  ✗ describe block {}", block.path));
                self.indented(errors);
            }
            TestRunnerEvent::RunFinished { results } => {
                self.line("");
                self.line(&format!(
                    "[tickrun] {} passed, {} failed, {} skipped, {} todo, {} describe block errors",
                    results.passed,
                    results.failed,
                    results.skipped,
                    results.todo,
                    results.describe_block_errors
                ));
            }
            TestRunnerEvent::RunCancelled => self.line("[tickrun] Run cancelled"),
            TestRunnerEvent::LoadError { error } => {
                self.line(&format!("[tickrun] LOAD ERROR: {error}"));
            }
            _ => {}
        }
    }

    fn on_log(&mut self, text: &str) {
        if self.in_test {
            self.buffered.push(text.to_string());
        } else {
            self.line(&format!("  | {text}"));
        }
    }

    fn on_result(&mut self, status: ResultStatus, focused: bool) {
        let focus = if focused { " (focused tests present)" } else { "" };
        self.line(&format!("[tickrun] Result: {status}{focus}"));
    }

    fn on_error(&mut self, message: &str) {
        self.line(&format!("[tickrun] FATAL ERROR: {message}"));
    }
}

// =============================================================================
// MultiReporter
// =============================================================================

/// MultiReporter - broadcasts events to multiple reporters
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for MultiReporter {
    fn on_event(&mut self, event: &TestRunnerEvent) {
        for r in &mut self.reporters {
            r.on_event(event);
        }
    }

    fn on_log(&mut self, text: &str) {
        for r in &mut self.reporters {
            r.on_log(text);
        }
    }

    fn on_result(&mut self, status: ResultStatus, focused: bool) {
        for r in &mut self.reporters {
            r.on_result(status, focused);
        }
    }

    fn on_error(&mut self, message: &str) {
        for r in &mut self.reporters {
            r.on_error(message);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Captured(Rc<RefCell<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn info(path: &str) -> TestInfo {
        TestInfo {
            path: path.to_string(),
            source: None,
            tags: Vec::new(),
            duration_ms: Some(12.0),
        }
    }

    #[test]
    fn test_json_event_serialization() {
        let event = MachineEvent::TestFinished {
            path: "f > a",
            status: "pass",
            duration_ms: None,
            errors: NO_ERRORS,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"test_finished\""));
        assert!(json.contains("\"path\":\"f > a\""));
        assert!(!json.contains("duration_ms"));
        assert!(!json.contains("errors"));
    }

    #[test]
    fn test_json_reporter_writes_one_line_per_event() {
        let sink = Captured::default();
        let mut reporter = JsonReporter::with_writer(Box::new(sink.clone()));
        reporter.on_event(&TestRunnerEvent::TestFailed {
            test: info("f > a"),
            errors: vec!["boom".to_string()],
        });
        reporter.on_result(ResultStatus::Failed, false);
        let text = sink.text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["status"], "fail");
        assert_eq!(first["errors"][0], "boom");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["status"], "failed");
    }

    #[test]
    fn test_human_reporter_shows_logs_only_for_failures() {
        let sink = Captured::default();
        let mut reporter = HumanReporter::with_writer(Box::new(sink.clone()));
        reporter.on_event(&TestRunnerEvent::TestStarted { test: info("a") });
        reporter.on_log("quiet");
        reporter.on_event(&TestRunnerEvent::TestPassed { test: info("a") });
        reporter.on_event(&TestRunnerEvent::TestStarted { test: info("b") });
        reporter.on_log("loud");
        reporter.on_event(&TestRunnerEvent::TestFailed {
            test: info("b"),
            errors: vec!["bad".to_string()],
        });
        let text = sink.text();
        assert!(text.contains("✓ a (12ms)"));
        assert!(!text.contains("quiet"));
        assert!(text.contains("    loud"));
        assert!(text.contains("    bad"));
    }

    #[test]
    fn test_multi_reporter_forwards_to_all() {
        let json = Captured::default();
        let human = Captured::default();
        let mut reporter = MultiReporter::new(vec![
            Box::new(JsonReporter::with_writer(Box::new(json.clone()))),
            Box::new(HumanReporter::with_writer(Box::new(human.clone()))),
        ]);
        reporter.on_error("host vanished");
        assert!(json.text().contains("\"message\":\"host vanished\""));
        assert!(human.text().contains("FATAL ERROR: host vanished"));
    }
}
