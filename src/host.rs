//! Host adapter
//!
//! Wraps the scheduler in a tick loop the way an embedding host would:
//! the host owns an ordered chain of tick handlers, the scheduler link is
//! inserted in front for the duration of a run, and a reload drops the
//! runner and the tree, rebuilds both from the definition sources and
//! resumes from the stored checkpoint.

use crate::builder::{build_tree, Source};
use crate::config::TestConfig;
use crate::error::Result;
use crate::listener::{HumanLogger, TestListener, WireEmitter};
use crate::protocol::ResultStatus;
use crate::scheduler::{TestRunner, TickOutcome};
use crate::signals;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Checkpoint storage
// =============================================================================

/// Where a checkpoint waits while the host restarts
pub trait CheckpointStore {
    fn save(&mut self, bytes: &[u8]) -> Result<()>;
    /// Remove and return the stored checkpoint
    fn take(&mut self) -> Result<Option<Vec<u8>>>;
    fn set_running(&mut self, running: bool) -> Result<()>;
    /// True if a run was in progress when the host last stopped
    fn is_running(&self) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    checkpoint: Option<Vec<u8>>,
    running: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// State left behind by a host that stopped mid-run
    pub fn mid_run(checkpoint: Option<Vec<u8>>) -> Self {
        Self {
            checkpoint,
            running: true,
        }
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        self.checkpoint = Some(bytes.to_vec());
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.checkpoint.take())
    }

    fn set_running(&mut self, running: bool) -> Result<()> {
        self.running = running;
        Ok(())
    }

    fn is_running(&self) -> Result<bool> {
        Ok(self.running)
    }
}

/// Directory-backed store that survives a real process restart
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    const CHECKPOINT: &'static str = "checkpoint.bin";
    const RUNNING: &'static str = "running";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CheckpointStore for FileStore {
    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(Self::CHECKPOINT), bytes)?;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(Self::CHECKPOINT);
        match fs::read(&path) {
            Ok(bytes) => {
                fs::remove_file(&path)?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_running(&mut self, running: bool) -> Result<()> {
        let marker = self.dir.join(Self::RUNNING);
        if running {
            fs::create_dir_all(&self.dir)?;
            fs::write(marker, b"")?;
        } else {
            match fs::remove_file(marker) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn is_running(&self) -> Result<bool> {
        Ok(self.dir.join(Self::RUNNING).exists())
    }
}

// =============================================================================
// Tick dispatch
// =============================================================================

pub type TickHandler = Box<dyn FnMut(u64)>;

enum Link {
    Scheduler,
    Host(TickHandler),
}

/// Ordered chain of per-tick handlers. The scheduler link is added in
/// front of the host's own handlers for a run and removed afterwards.
#[derive(Default)]
pub struct TickChain {
    links: Vec<Link>,
}

impl TickChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: TickHandler) {
        self.links.push(Link::Host(handler));
    }

    pub fn install_scheduler(&mut self) {
        if !self.has_scheduler() {
            self.links.insert(0, Link::Scheduler);
        }
    }

    /// Drop the scheduler link, leaving host handlers in their order
    pub fn restore(&mut self) {
        self.links.retain(|link| !matches!(link, Link::Scheduler));
    }

    pub fn has_scheduler(&self) -> bool {
        self.links.iter().any(|link| matches!(link, Link::Scheduler))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Invoke every link for tick `now`
    pub fn dispatch(&mut self, now: u64, scheduler: &mut dyn FnMut(u64)) {
        for link in &mut self.links {
            match link {
                Link::Scheduler => scheduler(now),
                Link::Host(handler) => handler(now),
            }
        }
    }
}

impl std::fmt::Debug for TickChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickChain")
            .field("links", &self.links.len())
            .field("scheduler", &self.has_scheduler())
            .finish()
    }
}

// =============================================================================
// Host loop
// =============================================================================

pub type ListenerFactory = Box<dyn Fn() -> Vec<Box<dyn TestListener>>>;

/// Default listeners: human-readable lines, then protocol lines, on stdout
pub fn stdout_listeners() -> Vec<Box<dyn TestListener>> {
    vec![
        Box::new(HumanLogger::new(io::stdout())),
        Box::new(WireEmitter::new(io::stdout())),
    ]
}

pub struct HostLoop<S: CheckpointStore> {
    sources: Vec<Source>,
    config: TestConfig,
    store: S,
    chain: TickChain,
    listeners: ListenerFactory,
    on_reload: Vec<Box<dyn FnMut()>>,
    max_ticks: Option<u64>,
    reloads: u32,
}

impl<S: CheckpointStore> HostLoop<S> {
    pub fn new(sources: Vec<Source>, config: TestConfig, store: S) -> Self {
        Self {
            sources,
            config,
            store,
            chain: TickChain::new(),
            listeners: Box::new(stdout_listeners),
            on_reload: Vec::new(),
            max_ticks: None,
            reloads: 0,
        }
    }

    /// Listener set for each (re)started runner
    pub fn with_listeners<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Vec<Box<dyn TestListener>> + 'static,
    {
        self.listeners = Box::new(factory);
        self
    }

    /// Cancel the run if it has not finished after this many ticks
    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }

    /// Register one of the host's own tick handlers
    pub fn on_tick<F>(mut self, handler: F) -> Self
    where
        F: FnMut(u64) + 'static,
    {
        self.chain.register(Box::new(handler));
        self
    }

    /// Called whenever the host restarts for a reload
    pub fn on_reload<F>(mut self, f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        self.on_reload.push(Box::new(f));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn chain(&self) -> &TickChain {
        &self.chain
    }

    pub fn reloads(&self) -> u32 {
        self.reloads
    }

    /// Build the tree and create the runner: a fresh run, or a resume when
    /// the store says the host stopped mid-run
    pub fn start(&mut self) -> Result<TestRunner> {
        let tree = build_tree(&self.sources);
        let listeners = (self.listeners)();
        if self.store.is_running()? {
            let checkpoint = self.store.take()?;
            debug!(found = checkpoint.is_some(), "host started mid-run");
            Ok(TestRunner::resume(
                tree,
                self.config.clone(),
                listeners,
                checkpoint.as_deref(),
            ))
        } else {
            self.store.set_running(true)?;
            Ok(TestRunner::new(tree, self.config.clone(), listeners))
        }
    }

    /// Tick until the run finishes, reloading in place when a test asks
    pub fn run(&mut self) -> Result<ResultStatus> {
        let mut runner = self.start()?;
        self.chain.install_scheduler();
        let interval = self.config.tick_interval();
        let mut now: u64 = 0;

        loop {
            if signals::shutdown_requested() && runner.is_running() {
                runner.cancel();
            }
            if let Some(limit) = self.max_ticks {
                if now >= limit && runner.is_running() {
                    info!(ticks = limit, "tick limit reached, cancelling run");
                    runner.cancel();
                }
            }

            let mut outcome = TickOutcome::Waiting;
            self.chain
                .dispatch(now, &mut |tick| outcome = runner.tick(tick));

            match outcome {
                TickOutcome::Waiting | TickOutcome::Halted => {}
                TickOutcome::Finished(status) => {
                    self.chain.restore();
                    self.store.set_running(false)?;
                    return Ok(status);
                }
                TickOutcome::Reload(checkpoint) => {
                    self.store.save(&checkpoint.encode()?)?;
                    drop(runner);
                    self.chain.restore();
                    self.reloads += 1;
                    info!(reloads = self.reloads, "reloading host");
                    for hook in &mut self.on_reload {
                        hook();
                    }
                    runner = self.start()?;
                    self.chain.install_scheduler();
                }
            }

            now += 1;
            if let Some(interval) = interval {
                std::thread::sleep(interval);
            }
        }
    }
}

impl<S: CheckpointStore + std::fmt::Debug> std::fmt::Debug for HostLoop<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLoop")
            .field("sources", &self.sources)
            .field("store", &self.store)
            .field("chain", &self.chain)
            .field("reloads", &self.reloads)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_take_is_exactly_once() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path().join("state"));
        assert!(!store.is_running().unwrap());
        store.set_running(true).unwrap();
        store.save(b"abc").unwrap();
        assert!(store.is_running().unwrap());
        assert_eq!(store.take().unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.take().unwrap(), None);
        store.set_running(false).unwrap();
        store.set_running(false).unwrap();
        assert!(!store.is_running().unwrap());
    }

    #[test]
    fn test_chain_restores_host_handlers() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut chain = TickChain::new();
        let o = order.clone();
        chain.register(Box::new(move |_| o.borrow_mut().push("host")));
        chain.install_scheduler();
        chain.install_scheduler();
        assert_eq!(chain.len(), 2);

        let o = order.clone();
        chain.dispatch(0, &mut |_| o.borrow_mut().push("scheduler"));
        assert_eq!(*order.borrow(), vec!["scheduler", "host"]);

        chain.restore();
        assert!(!chain.has_scheduler());
        assert_eq!(chain.len(), 1);
    }

    fn quiet() -> Vec<Box<dyn TestListener>> {
        Vec::new()
    }

    #[test]
    fn test_reload_resumes_at_next_part() {
        let parts = Rc::new(RefCell::new(Vec::new()));
        let p = parts.clone();
        let sources = vec![Source::new("f", move |s| {
            let first = p.clone();
            let second = p.clone();
            s.test("reloads", move |_| {
                first.borrow_mut().push(0);
                Ok(())
            })
            .after_reload(move |_| {
                second.borrow_mut().push(1);
                Ok(())
            });
            Ok(())
        })];
        let mut host = HostLoop::new(sources, TestConfig::default(), MemoryStore::new())
            .with_listeners(quiet);
        assert_eq!(host.run().unwrap(), ResultStatus::Passed);
        assert_eq!(*parts.borrow(), vec![0, 1]);
        assert_eq!(host.reloads(), 1);
        assert!(!host.store().is_running().unwrap());
        assert!(!host.chain().has_scheduler());
    }

    #[test]
    fn test_mid_run_start_without_checkpoint_is_load_error() {
        let sources = vec![Source::new("f", |s| {
            s.test("a", |_| Ok(()));
            Ok(())
        })];
        let mut host = HostLoop::new(sources, TestConfig::default(), MemoryStore::mid_run(None))
            .with_listeners(quiet);
        assert_eq!(host.run().unwrap(), ResultStatus::LoadError);
    }

    #[test]
    fn test_host_handlers_keep_ticking_during_run() {
        let ticks = Rc::new(RefCell::new(0u64));
        let t = ticks.clone();
        let sources = vec![Source::new("f", |s| {
            s.test("waits", |ctx| {
                ctx.after_ticks(4, |ctx| ctx.done());
                Ok(())
            });
            Ok(())
        })];
        let mut host = HostLoop::new(sources, TestConfig::default(), MemoryStore::new())
            .with_listeners(quiet)
            .on_tick(move |_| *t.borrow_mut() += 1);
        assert_eq!(host.run().unwrap(), ResultStatus::Passed);
        assert_eq!(*ticks.borrow(), 5);
    }

    #[test]
    fn test_tick_limit_cancels() {
        let sources = vec![Source::new("f", |s| {
            s.test("forever", |ctx| {
                ctx.async_test(Some(u64::MAX));
                Ok(())
            });
            Ok(())
        })];
        let mut host = HostLoop::new(sources, TestConfig::default(), MemoryStore::new())
            .with_listeners(quiet)
            .with_max_ticks(10);
        assert_eq!(host.run().unwrap(), ResultStatus::Cancelled);
    }
}
