//! Event Listener Bus
//!
//! Every lifecycle event goes through [`ListenerBus::emit`]. The bus owns
//! the [`RunResults`] and folds each event into them before any listener
//! runs, so listeners only ever read results.

use crate::config::TestConfig;
use crate::protocol::{
    encode_event, encode_message, encode_result, BlockInfo, ResultStatus, RunSummary, TestInfo,
    TestRunnerEvent,
};
use crate::tree::{NodeId, TestTree};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Lifecycle events, addressed by node handle
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted,
    RunFinished,
    /// Carries the test that was in flight, if any
    RunCancelled(Option<NodeId>),
    BlockEntered(NodeId),
    BlockFinished(NodeId),
    BlockFailed(NodeId),
    TestEntered(NodeId),
    TestStarted(NodeId),
    TestPassed(NodeId),
    TestFailed(NodeId),
    TestSkipped(NodeId),
    TestTodo(NodeId),
    LoadError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResults {
    pub ran: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub todo: u32,
    pub cancelled: u32,
    pub describe_block_errors: u32,
    pub status: Option<ResultStatus>,
}

impl RunResults {
    pub fn compute_status(&self) -> ResultStatus {
        if self.failed > 0 || self.describe_block_errors > 0 {
            ResultStatus::Failed
        } else if self.todo > 0 {
            ResultStatus::Todo
        } else {
            ResultStatus::Passed
        }
    }

    /// The aggregator: the only place results change during a run
    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::TestPassed(_) => {
                self.ran += 1;
                self.passed += 1;
            }
            RunEvent::TestFailed(_) => {
                self.ran += 1;
                self.failed += 1;
            }
            RunEvent::TestSkipped(_) => self.skipped += 1,
            RunEvent::TestTodo(_) => self.todo += 1,
            RunEvent::BlockFailed(_) => self.describe_block_errors += 1,
            RunEvent::RunFinished => self.status = Some(self.compute_status()),
            RunEvent::RunCancelled(in_flight) => {
                if in_flight.is_some() {
                    self.cancelled += 1;
                }
                self.status = Some(ResultStatus::Cancelled);
            }
            RunEvent::LoadError(_) => self.status = Some(ResultStatus::LoadError),
            RunEvent::RunStarted
            | RunEvent::BlockEntered(_)
            | RunEvent::BlockFinished(_)
            | RunEvent::TestEntered(_)
            | RunEvent::TestStarted(_) => {}
        }
    }

    pub fn to_summary(&self, has_focused_tests: bool) -> RunSummary {
        RunSummary {
            ran: self.ran,
            passed: self.passed,
            failed: self.failed,
            skipped: self.skipped,
            todo: self.todo,
            cancelled: self.cancelled,
            describe_block_errors: self.describe_block_errors,
            status: self.status,
            has_focused_tests,
        }
    }
}

/// Read-only state handed to listeners
#[derive(Clone, Copy)]
pub struct RunView<'a> {
    pub results: &'a RunResults,
    pub tree: &'a TestTree,
    pub config: &'a TestConfig,
}

pub trait TestListener {
    fn on_event(&mut self, event: &RunEvent, view: &RunView<'_>);
}

impl<F> TestListener for F
where
    F: FnMut(&RunEvent, &RunView<'_>),
{
    fn on_event(&mut self, event: &RunEvent, view: &RunView<'_>) {
        self(event, view)
    }
}

pub struct ListenerBus {
    results: RunResults,
    listeners: Vec<Box<dyn TestListener>>,
}

impl ListenerBus {
    pub fn new(listeners: Vec<Box<dyn TestListener>>) -> Self {
        Self {
            results: RunResults::default(),
            listeners,
        }
    }

    pub fn results(&self) -> &RunResults {
        &self.results
    }

    pub(crate) fn restore_results(&mut self, results: RunResults) {
        self.results = results;
    }

    pub fn emit(&mut self, event: RunEvent, tree: &TestTree, config: &TestConfig) {
        self.results.apply(&event);
        let view = RunView {
            results: &self.results,
            tree,
            config,
        };
        for listener in &mut self.listeners {
            listener.on_event(&event, &view);
        }
    }
}

impl std::fmt::Debug for ListenerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBus")
            .field("results", &self.results)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// =============================================================================
// Wire conversion
// =============================================================================

pub fn test_info(tree: &TestTree, id: NodeId) -> TestInfo {
    let node = tree.node(id);
    TestInfo {
        path: node.path.clone(),
        source: node.source.clone(),
        tags: tree.effective_tags(id).into_iter().collect(),
        duration_ms: node
            .as_test()
            .and_then(|t| t.duration)
            .map(|d| d.as_secs_f64() * 1000.0),
    }
}

pub fn block_info(tree: &TestTree, id: NodeId) -> BlockInfo {
    let node = tree.node(id);
    BlockInfo {
        path: node.path.clone(),
        source: node.source.clone(),
    }
}

pub fn to_wire(event: &RunEvent, view: &RunView<'_>) -> TestRunnerEvent {
    let tree = view.tree;
    match event {
        RunEvent::RunStarted => TestRunnerEvent::RunStarted,
        RunEvent::RunFinished => TestRunnerEvent::RunFinished {
            results: view.results.to_summary(tree.has_focus()),
        },
        RunEvent::RunCancelled(_) => TestRunnerEvent::RunCancelled,
        RunEvent::BlockEntered(id) => TestRunnerEvent::DescribeBlockEntered {
            block: block_info(tree, *id),
        },
        RunEvent::BlockFinished(id) => TestRunnerEvent::DescribeBlockFinished {
            block: block_info(tree, *id),
        },
        RunEvent::BlockFailed(id) => TestRunnerEvent::DescribeBlockFailed {
            block: block_info(tree, *id),
            errors: tree.node(*id).errors.clone(),
        },
        RunEvent::TestEntered(id) => TestRunnerEvent::TestEntered {
            test: test_info(tree, *id),
        },
        RunEvent::TestStarted(id) => TestRunnerEvent::TestStarted {
            test: test_info(tree, *id),
        },
        RunEvent::TestPassed(id) => TestRunnerEvent::TestPassed {
            test: test_info(tree, *id),
        },
        RunEvent::TestFailed(id) => TestRunnerEvent::TestFailed {
            test: test_info(tree, *id),
            errors: tree.node(*id).errors.clone(),
        },
        RunEvent::TestSkipped(id) => TestRunnerEvent::TestSkipped {
            test: test_info(tree, *id),
        },
        RunEvent::TestTodo(id) => TestRunnerEvent::TestTodo {
            test: test_info(tree, *id),
        },
        RunEvent::LoadError(error) => TestRunnerEvent::LoadError {
            error: error.clone(),
        },
    }
}

// =============================================================================
// Built-in listeners
// =============================================================================

/// Writes every event as a protocol line, and the result line at the end
pub struct WireEmitter<W: Write> {
    out: W,
}

impl<W: Write> WireEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            tracing::warn!("failed to write protocol line: {}", e);
        }
    }
}

impl<W: Write> TestListener for WireEmitter<W> {
    fn on_event(&mut self, event: &RunEvent, view: &RunView<'_>) {
        match encode_event(&to_wire(event, view)) {
            Ok(line) => self.write_line(&line),
            Err(e) => tracing::warn!("failed to encode event: {}", e),
        }
        if matches!(
            event,
            RunEvent::RunFinished | RunEvent::RunCancelled(_) | RunEvent::LoadError(_)
        ) {
            let status = view.results.status.unwrap_or_else(|| view.results.compute_status());
            self.write_line(&encode_result(status, view.tree.has_focus()));
        }
    }
}

/// Human-readable progress, multi-line failures wrapped in message blocks
pub struct HumanLogger<W: Write> {
    out: W,
}

impl<W: Write> HumanLogger<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write(&mut self, text: &str) {
        if let Err(e) = writeln!(self.out, "{text}").and_then(|_| self.out.flush()) {
            tracing::warn!("failed to write log line: {}", e);
        }
    }

    fn write_block(&mut self, headline: String, errors: &[String]) {
        let mut lines = vec![headline];
        lines.extend(errors.iter().flat_map(|e| e.lines().map(str::to_string)));
        self.write(&encode_message(&lines));
    }
}

impl<W: Write> TestListener for HumanLogger<W> {
    fn on_event(&mut self, event: &RunEvent, view: &RunView<'_>) {
        let tree = view.tree;
        match event {
            RunEvent::TestPassed(id) if view.config.log_passed_tests => {
                let info = test_info(tree, *id);
                match info.duration_ms {
                    Some(ms) => self.write(&format!("PASS {} ({ms:.1} ms)", info.path)),
                    None => self.write(&format!("PASS {}", info.path)),
                }
            }
            RunEvent::TestFailed(id) => {
                let node = tree.node(*id);
                self.write_block(format!("tickrun: FAIL {}", node.path), &node.errors);
            }
            RunEvent::TestSkipped(id) if view.config.log_skipped_tests => {
                self.write(&format!("SKIP {}", tree.node(*id).path));
            }
            RunEvent::TestTodo(id) => self.write(&format!("TODO {}", tree.node(*id).path)),
            RunEvent::BlockFailed(id) => {
                let node = tree.node(*id);
                let path = if node.path.is_empty() {
                    "<root>"
                } else {
                    node.path.as_str()
                };
                self.write_block(format!("tickrun: ERROR in {path}"), &node.errors);
            }
            RunEvent::LoadError(error) => {
                self.write_block("tickrun: LOAD ERROR".to_string(), std::slice::from_ref(error));
            }
            RunEvent::RunFinished => {
                let r = view.results;
                self.write(&format!(
                    "Ran {} tests: {} passed, {} failed, {} skipped, {} todo, {} describe block errors",
                    r.ran, r.passed, r.failed, r.skipped, r.todo, r.describe_block_errors
                ));
            }
            RunEvent::RunCancelled(_) => self.write("Run cancelled"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tree, Source};
    use crate::protocol::{DecodedLine, LineDecoder};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn tree() -> TestTree {
        build_tree(&[Source::new("f", |s| {
            s.test("t", |_| Ok(())).tags(["io"]);
            Ok(())
        })])
    }

    #[test]
    fn test_status_rules() {
        let mut results = RunResults::default();
        assert_eq!(results.compute_status(), ResultStatus::Passed);
        results.todo = 1;
        assert_eq!(results.compute_status(), ResultStatus::Todo);
        results.describe_block_errors = 1;
        assert_eq!(results.compute_status(), ResultStatus::Failed);
    }

    #[test]
    fn test_aggregator_runs_before_listeners() {
        let tree = tree();
        let id = tree.find_by_path("f > t").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let listener: Box<dyn TestListener> = Box::new(move |_: &RunEvent, view: &RunView<'_>| {
            sink.borrow_mut().push(view.results.passed);
        });
        let mut bus = ListenerBus::new(vec![listener]);
        let config = TestConfig::default();
        bus.emit(RunEvent::TestPassed(id), &tree, &config);
        bus.emit(RunEvent::RunFinished, &tree, &config);
        assert_eq!(*seen.borrow(), vec![1, 1]);
        assert_eq!(bus.results().status, Some(ResultStatus::Passed));
    }

    #[test]
    fn test_wire_emitter_output_decodes() {
        let tree = tree();
        let id = tree.find_by_path("f > t").unwrap();
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let config = TestConfig::default();
        let mut results = RunResults::default();
        let mut emitter = WireEmitter::new(SharedBuf(buffer.clone()));

        for event in [RunEvent::TestPassed(id), RunEvent::RunFinished] {
            results.apply(&event);
            let view = RunView {
                results: &results,
                tree: &tree,
                config: &config,
            };
            emitter.on_event(&event, &view);
        }

        let text = String::from_utf8(buffer.borrow().clone()).unwrap();
        let mut decoder = LineDecoder::new();
        let decoded: Vec<_> = text.lines().filter_map(|l| decoder.decode(l)).collect();
        assert_eq!(decoded.len(), 3);
        match &decoded[0] {
            DecodedLine::Event(TestRunnerEvent::TestPassed { test }) => {
                assert_eq!(test.path, "f > t");
                assert_eq!(test.tags, vec!["io".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            decoded[2],
            DecodedLine::Result {
                status: ResultStatus::Passed,
                focused: false
            }
        );
    }

    #[test]
    fn test_human_logger_wraps_failures() {
        let mut tree = tree();
        let id = tree.find_by_path("f > t").unwrap();
        tree.node_mut(id).errors.push("line one\nline two".to_string());
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let mut logger = HumanLogger::new(SharedBuf(buffer.clone()));
        let results = RunResults::default();
        let config = TestConfig::default();
        let view = RunView {
            results: &results,
            tree: &tree,
            config: &config,
        };
        logger.on_event(&RunEvent::TestFailed(id), &view);

        let text = String::from_utf8(buffer.borrow().clone()).unwrap();
        let mut decoder = LineDecoder::new();
        let decoded: Vec<_> = text.lines().filter_map(|l| decoder.decode(l)).collect();
        match &decoded[..] {
            [DecodedLine::Message(message)] => {
                assert_eq!(message.headline, "FAIL f > t");
                assert_eq!(message.lines, vec!["line one", "line two"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
