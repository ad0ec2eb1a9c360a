//! Integration tests for checkpoint/resume across host restarts

use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;
use tickrun::builder::{build_tree, Source};
use tickrun::checkpoint::{Checkpoint, ResumeError};
use tickrun::config::TestConfig;
use tickrun::host::{CheckpointStore, FileStore, HostLoop};
use tickrun::listener::{RunEvent, RunView, TestListener};
use tickrun::protocol::ResultStatus;
use tickrun::scheduler::{TestRunner, TickOutcome};

type Log = Rc<RefCell<Vec<String>>>;

fn recorder(log: &Log) -> Vec<Box<dyn TestListener>> {
    let log = log.clone();
    let listener: Box<dyn TestListener> = Box::new(move |event: &RunEvent, view: &RunView<'_>| {
        let line = match event {
            RunEvent::RunStarted => "start".to_string(),
            RunEvent::TestStarted(id) => format!("started {}", view.tree.node(*id).path),
            RunEvent::TestPassed(id) => format!("pass {}", view.tree.node(*id).path),
            RunEvent::TestFailed(id) => format!("fail {}", view.tree.node(*id).path),
            RunEvent::LoadError(e) => format!("load error: {e}"),
            _ => return,
        };
        log.borrow_mut().push(line);
    });
    vec![listener]
}

/// Sources with a two-part test between two plain tests. `parts` records
/// which parts ran.
fn sources(parts: &Log, extra: bool) -> Vec<Source> {
    let parts = parts.clone();
    vec![Source::new("f", move |s| {
        s.test("before", |_| anyhow::bail!("fails before the reload"));
        let first = parts.clone();
        let second = parts.clone();
        s.test("reloads", move |_| {
            first.borrow_mut().push("part 0".to_string());
            Ok(())
        })
        .after_reload(move |_| {
            second.borrow_mut().push("part 1".to_string());
            Ok(())
        });
        s.test("after", |_| Ok(()));
        if extra {
            s.test("added later", |_| Ok(()));
        }
        Ok(())
    })]
}

fn config() -> TestConfig {
    TestConfig {
        reorder_failed_first: false,
        ..TestConfig::default()
    }
}

/// Tick a fresh run until it asks for a reload
fn run_until_reload(sources: &[Source], log: &Log) -> Vec<u8> {
    run_until_reload_with(sources, config(), log)
}

fn run_until_reload_with(sources: &[Source], config: TestConfig, log: &Log) -> Vec<u8> {
    let mut runner = TestRunner::new(build_tree(sources), config, recorder(log));
    for now in 0..100 {
        match runner.tick(now) {
            TickOutcome::Reload(checkpoint) => {
                return checkpoint.encode().expect("Checkpoint should encode")
            }
            TickOutcome::Waiting => {}
            other => panic!("expected a reload, got {other:?}"),
        }
    }
    panic!("no reload requested");
}

fn finish(runner: &mut TestRunner) -> ResultStatus {
    for now in 0..100 {
        if let TickOutcome::Finished(status) = runner.tick(now) {
            return status;
        }
    }
    panic!("run did not finish");
}

#[test]
fn test_resume_with_identical_tree_completes_run() {
    let parts = Log::default();
    let log = Log::default();
    let bytes = run_until_reload(&sources(&parts, false), &log);
    assert_eq!(*parts.borrow(), vec!["part 0"]);

    let resumed_log = Log::default();
    let mut runner = TestRunner::resume(
        build_tree(&sources(&parts, false)),
        config(),
        recorder(&resumed_log),
        Some(bytes.as_slice()),
    );
    assert_eq!(finish(&mut runner), ResultStatus::Failed);
    assert_eq!(*parts.borrow(), vec!["part 0", "part 1"]);
    assert_eq!(
        *resumed_log.borrow(),
        vec!["pass f > reloads", "started f > after", "pass f > after"]
    );

    // The failure before the restart is carried in the results
    let results = runner.results();
    assert_eq!((results.passed, results.failed), (2, 1));
    let before = runner.tree().find_by_path("f > before").unwrap();
    assert_eq!(runner.tree().node(before).errors.len(), 1);
}

#[test]
fn test_resume_with_changed_tree_is_load_error() {
    let parts = Log::default();
    let bytes = run_until_reload(&sources(&parts, false), &Log::default());

    let log = Log::default();
    let mut runner = TestRunner::resume(
        build_tree(&sources(&parts, true)),
        config(),
        recorder(&log),
        Some(bytes.as_slice()),
    );
    assert_eq!(finish(&mut runner), ResultStatus::LoadError);
    assert_eq!(*parts.borrow(), vec!["part 0"], "No test may run after a mismatch");
    assert_eq!(log.borrow().len(), 1);
    assert!(log.borrow()[0].starts_with("load error:"));
}

#[test]
fn test_verify_reports_first_difference() {
    let parts = Log::default();
    let bytes = run_until_reload(&sources(&parts, false), &Log::default());
    let checkpoint = Checkpoint::decode(&bytes).expect("Should decode");
    assert_eq!(checkpoint.test_path, "f > reloads");

    let changed = build_tree(&sources(&parts, true));
    match checkpoint.verify(&changed) {
        Err(ResumeError::DefinitionsChanged(message)) => assert!(message.starts_with("f:")),
        other => panic!("expected a definitions mismatch, got {other:?}"),
    }
}

#[test]
fn test_corrupt_checkpoint_is_rejected() {
    assert!(matches!(
        Checkpoint::decode(&[1, 2]),
        Err(ResumeError::Corrupt(_))
    ));
    assert!(matches!(
        Checkpoint::decode(&[200, 0, 0, 0, 1, 2, 3]),
        Err(ResumeError::Corrupt(_))
    ));
}

#[test]
fn test_host_resumes_from_file_store_after_restart() {
    let dir = TempDir::new().unwrap();
    let parts = Log::default();

    // First host process: stops right after saving its checkpoint
    let bytes = run_until_reload(&sources(&parts, false), &Log::default());
    let mut store = FileStore::new(dir.path());
    store.set_running(true).unwrap();
    store.save(&bytes).unwrap();

    // Second host process: same definitions, same state directory
    let log = Log::default();
    let factory_log = log.clone();
    let mut host = HostLoop::new(sources(&parts, false), config(), FileStore::new(dir.path()))
        .with_listeners(move || recorder(&factory_log));
    assert_eq!(host.run().unwrap(), ResultStatus::Failed);
    assert_eq!(*parts.borrow(), vec!["part 0", "part 1"]);
    assert!(!log.borrow().contains(&"start".to_string()));
    assert!(!host.store().is_running().unwrap());
}

#[test]
fn test_invalid_elapsed_time_is_load_error() {
    let parts = Log::default();
    let bytes = run_until_reload(&sources(&parts, false), &Log::default());
    let mut checkpoint = Checkpoint::decode(&bytes).unwrap();
    checkpoint.elapsed_ms = -5.0;
    let tampered = checkpoint.encode().unwrap();

    assert!(matches!(
        Checkpoint::decode(&tampered),
        Err(ResumeError::Corrupt(_))
    ));

    let log = Log::default();
    let mut runner = TestRunner::resume(
        build_tree(&sources(&parts, false)),
        config(),
        recorder(&log),
        Some(tampered.as_slice()),
    );
    assert_eq!(finish(&mut runner), ResultStatus::LoadError);
    assert_eq!(*parts.borrow(), vec!["part 0"]);
    assert!(log.borrow()[0].starts_with("load error: Checkpoint is unreadable"));
}

#[test]
fn test_invalid_test_duration_is_corrupt() {
    let parts = Log::default();
    let bytes = run_until_reload(&sources(&parts, false), &Log::default());
    let mut checkpoint = Checkpoint::decode(&bytes).unwrap();
    let state = checkpoint
        .node_state
        .iter_mut()
        .find(|s| s.duration_ms.is_some())
        .expect("The failed test before the reload has a duration");
    state.duration_ms = Some(f64::NAN);

    let tampered = checkpoint.encode().unwrap();
    assert!(matches!(
        Checkpoint::decode(&tampered),
        Err(ResumeError::Corrupt(_))
    ));
}

#[test]
fn test_resume_keeps_failed_first_order() {
    let parts = Log::default();
    let second = parts.clone();
    let reordered = vec![Source::new("f", move |s| {
        s.test("a", |_| Ok(()));
        s.test("b", |_| Ok(()));
        let part = second.clone();
        s.test("r", |_| Ok(())).after_reload(move |_| {
            part.borrow_mut().push("r resumed".to_string());
            Ok(())
        });
        Ok(())
    })];
    let config = TestConfig {
        reorder_failed_first: true,
        failed_tests: vec!["f > b".to_string()],
        ..TestConfig::default()
    };

    let first_log = Log::default();
    let bytes = run_until_reload_with(&reordered, config.clone(), &first_log);
    assert_eq!(
        *first_log.borrow(),
        vec!["start", "started f > b", "pass f > b", "started f > a", "pass f > a", "started f > r"]
    );

    let log = Log::default();
    let mut runner = TestRunner::resume(
        build_tree(&reordered),
        config,
        recorder(&log),
        Some(bytes.as_slice()),
    );
    assert_eq!(finish(&mut runner), ResultStatus::Passed);
    assert_eq!(*parts.borrow(), vec!["r resumed"]);
    assert_eq!(*log.borrow(), vec!["pass f > r"]);

    let tree = runner.tree();
    let block = tree.find_by_path("f").unwrap();
    let order: Vec<&str> = tree
        .children(block)
        .iter()
        .map(|id| tree.node(*id).path.as_str())
        .collect();
    assert_eq!(order, vec!["f > b", "f > a", "f > r"]);
}
