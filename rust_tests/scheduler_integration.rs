//! Integration tests for the scheduler, observed through the wire protocol
//!
//! Each run writes protocol lines into a buffer; the buffer is decoded and
//! collected exactly like the supervisor does with a real host.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use tickrun::builder::{build_tree, Source, Suite};
use tickrun::collector::{RunCollector, RunReport, TestResultKind};
use tickrun::config::TestConfig;
use tickrun::listener::{TestListener, WireEmitter};
use tickrun::protocol::{DecodedLine, LineDecoder, ResultStatus, TestRunnerEvent};
use tickrun::scheduler::{TestRunner, TickOutcome};

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.borrow())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn config() -> TestConfig {
    TestConfig {
        reorder_failed_first: false,
        ..TestConfig::default()
    }
}

/// Run `sources` to completion and decode everything the host wrote
fn run(sources: Vec<Source>, config: TestConfig) -> (ResultStatus, RunReport, Vec<String>) {
    let out = SharedBuf::default();
    let listeners: Vec<Box<dyn TestListener>> = vec![Box::new(WireEmitter::new(out.clone()))];
    let mut runner = TestRunner::new(build_tree(&sources), config, listeners);

    let mut status = None;
    for now in 0..10_000 {
        match runner.tick(now) {
            TickOutcome::Finished(s) => {
                status = Some(s);
                break;
            }
            TickOutcome::Waiting => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    let status = status.expect("Run should finish");

    let lines = out.lines();
    let mut decoder = LineDecoder::new();
    let mut collector = RunCollector::new();
    for line in &lines {
        if let Some(decoded) = decoder.decode(line) {
            collector.handle(&decoded);
        }
    }
    (status, collector.finish(), lines)
}

fn scenario(s: &mut Suite<'_>) -> anyhow::Result<()> {
    s.test("Pass", |_| Ok(()));
    s.test("Skip", |_| anyhow::bail!("skipped test ran")).skip();
    s.todo("TODO");
    s.test_each("each {}", [1, 2], |_, n| {
        anyhow::ensure!(*n > 0);
        Ok(())
    });
    s.test("In world", |ctx| {
        ctx.after_ticks(2, |ctx| ctx.done());
        Ok(())
    });
    s.describe("broken describe", |s| {
        s.test("never declared", |_| Ok(()));
        anyhow::bail!("describe body threw")
    });
    s.describe("afterAll fails", |s| {
        s.after_all(|| anyhow::bail!("teardown threw"));
        s.test("inside", |_| Ok(()));
        Ok(())
    });
    s.describe_skip("skipped block", |s| {
        s.test("skipped child", |_| Ok(()));
        Ok(())
    });
    s.test("Fails", |_| anyhow::bail!("expected failure"));
    Ok(())
}

#[test]
fn test_scenario_summary() {
    let (status, report, _) = run(vec![Source::new("scenario", scenario)], config());

    assert_eq!(status, ResultStatus::Failed);
    assert_eq!(report.status, Some(ResultStatus::Failed));
    let summary = report.summary.clone().expect("runFinished carries a summary");
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.passed, 5);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.todo, 1);
    assert_eq!(summary.describe_block_errors, 2);
    assert_eq!(summary.status, Some(ResultStatus::Failed));
    assert!(!summary.has_focused_tests);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["describeBlockErrors"], 2);
    assert_eq!(json["status"], "failed");

    assert_eq!(report.failed_paths(), vec!["scenario > Fails"]);
    assert_eq!(report.block_errors.len(), 2);
    assert!(report.block_errors[1].errors[0].contains("teardown threw"));
}

#[test]
fn test_status_is_todo_without_failures() {
    let (status, _, lines) = run(
        vec![Source::new("f", |s| {
            s.test("a", |_| Ok(()));
            s.todo("later");
            Ok(())
        })],
        config(),
    );
    assert_eq!(status, ResultStatus::Todo);
    assert_eq!(lines.last().map(String::as_str), Some("TICKRUN-RESULT:todo"));
}

#[test]
fn test_focused_result_line() {
    let (status, report, lines) = run(
        vec![Source::new("f", |s| {
            s.test("a", |_| Ok(())).only();
            s.test("b", |_| anyhow::bail!("not focused"));
            Ok(())
        })],
        config(),
    );
    assert_eq!(status, ResultStatus::Passed);
    assert!(report.focused);
    assert_eq!(report.count(TestResultKind::Skipped), 1);
    assert_eq!(
        lines.last().map(String::as_str),
        Some("TICKRUN-RESULT:passed:focused")
    );
}

#[test]
fn test_only_inside_skipped_block_does_not_narrow_run() {
    let (status, report, lines) = run(
        vec![Source::new("f", |s| {
            s.describe_skip("sk", |s| {
                s.test("x", |_| Ok(())).only();
                Ok(())
            });
            s.test("y", |_| Ok(()));
            Ok(())
        })],
        config(),
    );
    assert_eq!(status, ResultStatus::Passed);
    let results: Vec<(&str, TestResultKind)> = report
        .tests
        .iter()
        .map(|t| (t.path.as_str(), t.result))
        .collect();
    assert_eq!(
        results,
        vec![("f > sk > x", TestResultKind::Skipped), ("f > y", TestResultKind::Passed)]
    );
    // The declared `only` still marks the run as focused
    assert_eq!(
        lines.last().map(String::as_str),
        Some("TICKRUN-RESULT:passed:focused")
    );
}

#[test]
fn test_bail_after_one_failure_never_starts_later_tests() {
    let (status, report, lines) = run(
        vec![Source::new("f", |s| {
            s.test("first", |_| Ok(()));
            s.test("breaks", |_| anyhow::bail!("boom"));
            s.test("later", |_| Ok(()));
            s.describe("later block", |s| {
                s.test("deep", |_| Ok(()));
                Ok(())
            });
            Ok(())
        })],
        TestConfig {
            bail: Some(1),
            ..config()
        },
    );
    assert_eq!(status, ResultStatus::Failed);
    let paths: Vec<&str> = report.tests.iter().map(|t| t.path.as_str()).collect();
    assert_eq!(paths, vec!["f > first", "f > breaks"]);

    let mut decoder = LineDecoder::new();
    let started: Vec<String> = lines
        .iter()
        .filter_map(|l| match decoder.decode(l) {
            Some(DecodedLine::Event(TestRunnerEvent::TestStarted { test })) => Some(test.path),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["f > first", "f > breaks"]);
}

#[test]
fn test_failed_first_runs_previous_failures_first() {
    let (_, report, _) = run(
        vec![Source::new("f", |s| {
            s.test("a", |_| Ok(()));
            s.describe("group", |s| {
                s.test("b", |_| Ok(()));
                s.test("c", |_| Ok(()));
                Ok(())
            });
            Ok(())
        })],
        TestConfig {
            reorder_failed_first: true,
            failed_tests: vec!["f > group > c".to_string()],
            ..TestConfig::default()
        },
    );
    let paths: Vec<&str> = report.tests.iter().map(|t| t.path.as_str()).collect();
    assert_eq!(paths, vec!["f > group > c", "f > group > b", "f > a"]);
}

#[test]
fn test_timeout_fails_only_that_test() {
    let (status, report, _) = run(
        vec![Source::new("f", |s| {
            s.test("slow", |ctx| {
                ctx.async_test(Some(5));
                Ok(())
            });
            s.test("fast", |_| Ok(()));
            Ok(())
        })],
        config(),
    );
    assert_eq!(status, ResultStatus::Failed);
    let slow = &report.tests[0];
    assert_eq!(slow.result, TestResultKind::Failed);
    assert!(slow.errors[0].starts_with("Test timed out after 5 ticks"));
    assert_eq!(report.tests[1].result, TestResultKind::Passed);
}

#[test]
fn test_panicking_body_is_a_failure() {
    let (status, report, _) = run(
        vec![Source::new("f", |s| {
            s.test("panics", |_| panic!("kaboom"));
            s.test("after", |_| Ok(()));
            Ok(())
        })],
        config(),
    );
    assert_eq!(status, ResultStatus::Failed);
    assert!(report.tests[0].errors[0].contains("kaboom"));
    assert_eq!(report.tests[1].result, TestResultKind::Passed);
}
