//! Resumable tick-driven scheduler
//!
//! The runner walks the test tree one task at a time. A call to
//! [`TestRunner::tick`] keeps executing tasks until the run finishes, an
//! async test needs more ticks, or a test asks for a host restart.

use crate::checkpoint::{Checkpoint, ResumeError};
use crate::config::TestConfig;
use crate::context::{guarded, run_tick_callbacks, TestContext, TestRun};
use crate::listener::{ListenerBus, RunEvent, RunResults, TestListener};
use crate::protocol::ResultStatus;
use crate::reorder::reorder_failed_first;
use crate::tree::{HookFn, HookKind, Mode, NodeId, TestTree};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

/// One step of the traversal
#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    RunStarted,
    EnterBlock(NodeId),
    EnterTest(NodeId),
    StartTest(NodeId),
    RunPart(NodeId, usize),
    WaitForPart(NodeId, usize),
    LeaveTest(NodeId),
    LeaveBlock(NodeId),
    RunFinished,
    ReportLoadError(String),
}

enum Step {
    Continue,
    Yield,
    Reload(Box<Checkpoint>),
}

/// What the host should do after a tick
#[derive(Debug)]
pub enum TickOutcome {
    /// Call again next tick
    Waiting,
    /// Save the checkpoint and restart the host
    Reload(Box<Checkpoint>),
    Finished(ResultStatus),
    /// A reload was requested; this runner does nothing more
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Halted,
    Finished(ResultStatus),
}

/// Tag and name filters from the run configuration
#[derive(Debug, Default)]
pub struct TestFilter {
    whitelist: BTreeSet<String>,
    blacklist: BTreeSet<String>,
    pattern: Option<Regex>,
}

impl TestFilter {
    pub fn from_config(config: &TestConfig) -> Result<Self, regex::Error> {
        let pattern = config.test_pattern.as_deref().map(Regex::new).transpose()?;
        Ok(Self {
            whitelist: config.tag_whitelist.iter().cloned().collect(),
            blacklist: config.tag_blacklist.iter().cloned().collect(),
            pattern,
        })
    }

    pub fn allows(&self, tree: &TestTree, id: NodeId) -> bool {
        let tags = tree.effective_tags(id);
        if !self.whitelist.is_empty() && self.whitelist.is_disjoint(&tags) {
            return false;
        }
        if !self.blacklist.is_disjoint(&tags) {
            return false;
        }
        self.pattern
            .as_ref()
            .map_or(true, |re| re.is_match(&tree.node(id).path))
    }
}

pub struct TestRunner {
    tree: TestTree,
    config: TestConfig,
    filter: TestFilter,
    bus: ListenerBus,
    next: Option<Task>,
    run: Option<TestRun>,
    state: RunState,
    /// Blocks with at least one test that will execute
    runnable: HashSet<NodeId>,
    bailing: bool,
    now: u64,
    failed_first: Vec<String>,
}

impl TestRunner {
    /// Prepare a fresh run. Nothing executes until the first tick.
    pub fn new(
        mut tree: TestTree,
        config: TestConfig,
        listeners: Vec<Box<dyn TestListener>>,
    ) -> Self {
        let mut failed_first = Vec::new();
        if config.reorder_failed_first && !config.failed_tests.is_empty() {
            let failed: BTreeSet<String> = config.failed_tests.iter().cloned().collect();
            if reorder_failed_first(&mut tree, &failed) {
                failed_first = config.failed_tests.clone();
            }
        }

        let (filter, first) = match TestFilter::from_config(&config) {
            Ok(filter) => (filter, Task::RunStarted),
            Err(e) => (
                TestFilter::default(),
                Task::ReportLoadError(format!("Invalid test pattern: {e}")),
            ),
        };

        let mut runner = Self {
            tree,
            config,
            filter,
            bus: ListenerBus::new(listeners),
            next: Some(first),
            run: None,
            state: RunState::Running,
            runnable: HashSet::new(),
            bailing: false,
            now: 0,
            failed_first,
        };
        runner.compute_runnable();
        runner
    }

    /// Continue a run after a host restart. `checkpoint` is `None` when the
    /// host was mid-run but nothing was saved.
    pub fn resume(
        mut tree: TestTree,
        config: TestConfig,
        listeners: Vec<Box<dyn TestListener>>,
        checkpoint: Option<&[u8]>,
    ) -> Self {
        let prepared = checkpoint
            .ok_or(ResumeError::UnexpectedRestart)
            .and_then(Checkpoint::decode)
            .and_then(|checkpoint| {
                if !checkpoint.failed_first.is_empty() {
                    let failed = checkpoint.failed_first.iter().cloned().collect();
                    reorder_failed_first(&mut tree, &failed);
                }
                let test = checkpoint.verify(&tree)?;
                Ok((checkpoint, test))
            });

        let config = TestConfig {
            reorder_failed_first: false,
            ..config
        };
        let mut runner = Self::new(tree, config, listeners);

        match prepared {
            Ok((checkpoint, test)) => {
                checkpoint.restore(&mut runner.tree);
                runner.bus.restore_results(checkpoint.results.clone());
                let mut run = TestRun::new(test);
                run.carried = checkpoint.elapsed();
                runner.run = Some(run);
                runner.failed_first = checkpoint.failed_first.clone();
                if matches!(runner.next, Some(Task::RunStarted)) {
                    runner.next = Some(Task::RunPart(test, checkpoint.resume_part));
                }
                info!(
                    test = %checkpoint.test_path,
                    part = checkpoint.resume_part,
                    "resuming run after restart"
                );
            }
            Err(e) => {
                info!("cannot resume run: {}", e);
                runner.next = Some(Task::ReportLoadError(e.to_string()));
            }
        }
        runner
    }

    pub fn tree(&self) -> &TestTree {
        &self.tree
    }

    pub fn results(&self) -> &RunResults {
        self.bus.results()
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Drive the run on host tick `now`
    pub fn tick(&mut self, now: u64) -> TickOutcome {
        self.now = now;
        loop {
            match self.state {
                RunState::Halted => return TickOutcome::Halted,
                RunState::Finished(status) => return TickOutcome::Finished(status),
                RunState::Running => {}
            }
            let Some(task) = self.next.take() else {
                let status = self.results().compute_status();
                self.state = RunState::Finished(status);
                continue;
            };
            match self.step(task) {
                Step::Continue => {}
                Step::Yield => return TickOutcome::Waiting,
                Step::Reload(checkpoint) => {
                    self.state = RunState::Halted;
                    return TickOutcome::Reload(checkpoint);
                }
            }
        }
    }

    /// Stop immediately. Hooks of open blocks do not run.
    pub fn cancel(&mut self) {
        if self.state != RunState::Running {
            return;
        }
        let in_flight = self.run.take().map(|run| run.test);
        self.next = None;
        self.emit(RunEvent::RunCancelled(in_flight));
        self.state = RunState::Finished(ResultStatus::Cancelled);
    }

    fn step(&mut self, task: Task) -> Step {
        debug!(?task, tick = self.now, "step");
        match task {
            Task::RunStarted => {
                self.emit(RunEvent::RunStarted);
                self.next = Some(Task::EnterBlock(self.tree.root()));
            }
            Task::EnterBlock(block) => self.enter_block(block),
            Task::EnterTest(test) => self.enter_test(test),
            Task::StartTest(test) => self.start_test(test),
            Task::RunPart(test, part) => return self.run_part(test, part),
            Task::WaitForPart(test, part) => return self.wait_for_part(test, part),
            Task::LeaveTest(test) => self.leave_test(test),
            Task::LeaveBlock(block) => self.leave_block(block),
            Task::RunFinished => {
                self.emit(RunEvent::RunFinished);
                let status = self.results().status.unwrap_or(ResultStatus::Failed);
                info!(%status, "run finished");
                self.state = RunState::Finished(status);
            }
            Task::ReportLoadError(error) => {
                self.emit(RunEvent::LoadError(error));
                self.state = RunState::Finished(ResultStatus::LoadError);
            }
        }
        Step::Continue
    }

    fn enter_block(&mut self, block: NodeId) {
        let root = self.tree.root();
        if block != root {
            self.emit(RunEvent::BlockEntered(block));
        }
        if self.runnable.contains(&block) && self.tree.node(block).errors.is_empty() {
            self.run_block_hooks(block, HookKind::BeforeAll);
        }
        if !self.tree.node(block).errors.is_empty() {
            self.next = Some(Task::LeaveBlock(block));
            return;
        }
        self.next = Some(match self.tree.children(block).first() {
            Some(child) => self.enter(*child),
            None => Task::LeaveBlock(block),
        });
    }

    fn enter_test(&mut self, test: NodeId) {
        self.emit(RunEvent::TestEntered(test));
        if self.tree.node(test).mode == Mode::Todo {
            self.emit(RunEvent::TestTodo(test));
            self.next = Some(self.next_after(test));
        } else if !self.should_run(test) {
            self.emit(RunEvent::TestSkipped(test));
            self.next = Some(self.next_after(test));
        } else {
            self.next = Some(Task::StartTest(test));
        }
    }

    fn start_test(&mut self, test: NodeId) {
        self.run = Some(TestRun::new(test));
        self.emit(RunEvent::TestStarted(test));

        let mut blocks = self.tree.ancestors(test);
        blocks.reverse();
        'outer: for block in blocks {
            for hook in self.hook_fns(block, HookKind::BeforeEach) {
                if let Err(e) = guarded(|| hook()) {
                    self.tree
                        .node_mut(test)
                        .errors
                        .push(format!("Error running beforeEach hook: {e}"));
                    break 'outer;
                }
            }
        }

        self.next = Some(if self.tree.node(test).errors.is_empty() {
            Task::RunPart(test, 0)
        } else {
            Task::LeaveTest(test)
        });
    }

    fn run_part(&mut self, test: NodeId, part: usize) -> Step {
        let Some(func) = self.tree.part(test, part).map(|p| p.func.clone()) else {
            self.next = Some(Task::LeaveTest(test));
            return Step::Continue;
        };
        let path = self.tree.node(test).path.clone();
        let default_timeout = self.config.default_timeout;
        let now = self.now;
        let run = self.run.get_or_insert_with(|| TestRun::new(test));
        run.begin_part(part, now);

        let outcome = {
            let mut ctx = TestContext::new(run, &path, now, default_timeout);
            guarded(|| func(&mut ctx))
        };
        if let Err(e) = outcome {
            self.tree.node_mut(test).errors.push(e);
            self.next = Some(Task::LeaveTest(test));
            return Step::Continue;
        }

        if run.is_waiting() {
            self.next = Some(Task::WaitForPart(test, part));
            return Step::Yield;
        }
        self.part_finished(test, part)
    }

    fn wait_for_part(&mut self, test: NodeId, part: usize) -> Step {
        let path = self.tree.node(test).path.clone();
        let Some(run) = self.run.as_mut() else {
            self.next = Some(Task::LeaveTest(test));
            return Step::Continue;
        };
        run_tick_callbacks(run, &path, self.now, self.config.default_timeout);

        if !run.errors.is_empty() {
            let errors = std::mem::take(&mut run.errors);
            self.tree.node_mut(test).errors.extend(errors);
            self.next = Some(Task::LeaveTest(test));
            return Step::Continue;
        }
        if run.done {
            return self.part_finished(test, part);
        }

        let elapsed = self.now.saturating_sub(run.tick_started);
        if elapsed >= run.timeout {
            let at = self
                .tree
                .part(test, part)
                .and_then(|p| p.source.as_ref())
                .map(|s| format!(" (at {s})"))
                .unwrap_or_default();
            let message = format!("Test timed out after {} ticks{at}", run.timeout);
            self.tree.node_mut(test).errors.push(message);
            self.next = Some(Task::LeaveTest(test));
            return Step::Continue;
        }

        self.next = Some(Task::WaitForPart(test, part));
        Step::Yield
    }

    /// A part completed cleanly: continue with the next part after a
    /// restart, or leave the test
    fn part_finished(&mut self, test: NodeId, part: usize) -> Step {
        if part + 1 >= self.tree.part_count(test) {
            self.next = Some(Task::LeaveTest(test));
            return Step::Continue;
        }
        let elapsed = self.run.as_ref().map(|r| r.elapsed()).unwrap_or_default();
        let checkpoint = Checkpoint::capture(
            &self.tree,
            self.bus.results(),
            test,
            part + 1,
            elapsed,
            self.failed_first.clone(),
        );
        info!(test = %self.tree.node(test).path, part = part + 1, "requesting host reload");
        self.run = None;
        Step::Reload(Box::new(checkpoint))
    }

    fn leave_test(&mut self, test: NodeId) {
        if let Some(mut run) = self.run.take() {
            for callback in std::mem::take(&mut run.after_test) {
                if let Err(e) = guarded(callback) {
                    self.tree
                        .node_mut(test)
                        .errors
                        .push(format!("Error running afterTest callback: {e}"));
                }
            }
            self.tree.set_duration(test, Some(run.elapsed()));
        }

        for block in self.tree.ancestors(test) {
            for hook in self.hook_fns(block, HookKind::AfterEach) {
                if let Err(e) = guarded(|| hook()) {
                    self.tree
                        .node_mut(test)
                        .errors
                        .push(format!("Error running afterEach hook: {e}"));
                    break;
                }
            }
        }

        if self.tree.node(test).errors.is_empty() {
            self.emit(RunEvent::TestPassed(test));
        } else {
            self.emit(RunEvent::TestFailed(test));
            if let Some(limit) = self.config.bail {
                if limit > 0 && self.results().failed >= limit && !self.bailing {
                    info!(failed = self.results().failed, "bail threshold reached");
                    self.bailing = true;
                }
            }
        }
        self.next = Some(self.next_after(test));
    }

    fn leave_block(&mut self, block: NodeId) {
        if self.runnable.contains(&block) {
            self.run_block_hooks(block, HookKind::AfterAll);
        }

        let root = self.tree.root();
        if !self.tree.node(block).errors.is_empty() {
            self.emit(RunEvent::BlockFailed(block));
        } else if block != root {
            self.emit(RunEvent::BlockFinished(block));
        }

        self.next = Some(if block == root {
            Task::RunFinished
        } else {
            self.next_after(block)
        });
    }

    /// Run one phase of a block's hooks; the first failure ends the phase
    fn run_block_hooks(&mut self, block: NodeId, kind: HookKind) {
        for hook in self.hook_fns(block, kind) {
            if let Err(e) = guarded(|| hook()) {
                self.tree
                    .node_mut(block)
                    .errors
                    .push(format!("Error running {kind} hook: {e}"));
                break;
            }
        }
    }

    fn hook_fns(&self, block: NodeId, kind: HookKind) -> Vec<HookFn> {
        self.tree.hooks(block, kind).map(|h| h.func.clone()).collect()
    }

    fn enter(&self, id: NodeId) -> Task {
        if self.tree.node(id).is_block() {
            Task::EnterBlock(id)
        } else {
            Task::EnterTest(id)
        }
    }

    fn next_after(&self, id: NodeId) -> Task {
        let Some(parent) = self.tree.node(id).parent else {
            return Task::RunFinished;
        };
        if self.bailing {
            return Task::LeaveBlock(parent);
        }
        let siblings = self.tree.children(parent);
        let next = siblings
            .iter()
            .position(|c| *c == id)
            .and_then(|i| siblings.get(i + 1));
        match next {
            Some(sibling) => self.enter(*sibling),
            None => Task::LeaveBlock(parent),
        }
    }

    fn should_run(&self, test: NodeId) -> bool {
        let node = self.tree.node(test);
        let mode_ok = match node.mode {
            Mode::Skip | Mode::Todo => false,
            Mode::Only => true,
            Mode::Normal => !self.tree.focus_active(),
        };
        mode_ok && self.filter.allows(&self.tree, test)
    }

    fn compute_runnable(&mut self) {
        let mut runnable = HashSet::new();
        self.mark_runnable(self.tree.root(), &mut runnable);
        self.runnable = runnable;
    }

    fn mark_runnable(&self, id: NodeId, runnable: &mut HashSet<NodeId>) -> bool {
        if self.tree.node(id).is_test() {
            return self.should_run(id);
        }
        let mut any = false;
        for child in self.tree.children(id) {
            any |= self.mark_runnable(*child, runnable);
        }
        if any {
            runnable.insert(id);
        }
        any
    }

    fn emit(&mut self, event: RunEvent) {
        self.bus.emit(event, &self.tree, &self.config);
    }
}

impl std::fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRunner")
            .field("next", &self.next)
            .field("state", &self.state)
            .field("run", &self.run)
            .field("bailing", &self.bailing)
            .finish_non_exhaustive()
    }
}
