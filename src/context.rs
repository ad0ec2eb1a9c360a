//! Per-test execution state and the handle test bodies receive
//!
//! A [`TestRun`] exists only while its test is in flight; the scheduler
//! drops it when the test leaves. Test bodies never see the scheduler,
//! only a [`TestContext`] borrowed from the current run.

use crate::tree::NodeId;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Returned by per-tick callbacks to stay registered or deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

pub type TickCallback = Box<dyn FnMut(&mut TestContext<'_>, u64) -> anyhow::Result<TickControl>>;
pub type AfterTestCallback = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// Ephemeral record of one in-flight test
pub struct TestRun {
    pub(crate) test: NodeId,
    pub(crate) part: usize,
    pub(crate) is_async: bool,
    pub(crate) explicit_timeout: bool,
    pub(crate) timeout: u64,
    pub(crate) done: bool,
    /// Tick at which the current part started
    pub(crate) tick_started: u64,
    pub(crate) tick_callbacks: Vec<TickCallback>,
    pub(crate) after_test: Vec<AfterTestCallback>,
    pub(crate) errors: Vec<String>,
    pub(crate) started_at: Instant,
    /// Wall time spent before a host reload
    pub(crate) carried: Duration,
}

impl TestRun {
    pub(crate) fn new(test: NodeId) -> Self {
        Self {
            test,
            part: 0,
            is_async: false,
            explicit_timeout: false,
            timeout: 0,
            done: false,
            tick_started: 0,
            tick_callbacks: Vec::new(),
            after_test: Vec::new(),
            errors: Vec::new(),
            started_at: Instant::now(),
            carried: Duration::ZERO,
        }
    }

    /// Reset async state at the start of a part
    pub(crate) fn begin_part(&mut self, part: usize, now: u64) {
        self.part = part;
        self.tick_started = now;
        self.is_async = false;
        self.explicit_timeout = false;
        self.done = false;
        self.tick_callbacks.clear();
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.carried + self.started_at.elapsed()
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.is_async && !self.done
    }
}

impl std::fmt::Debug for TestRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRun")
            .field("test", &self.test)
            .field("part", &self.part)
            .field("is_async", &self.is_async)
            .field("timeout", &self.timeout)
            .field("done", &self.done)
            .field("tick_started", &self.tick_started)
            .field("tick_callbacks", &self.tick_callbacks.len())
            .finish_non_exhaustive()
    }
}

/// Testing API available inside test bodies and tick callbacks
pub struct TestContext<'a> {
    run: &'a mut TestRun,
    path: &'a str,
    now: u64,
    default_timeout: u64,
}

impl<'a> TestContext<'a> {
    pub(crate) fn new(run: &'a mut TestRun, path: &'a str, now: u64, default_timeout: u64) -> Self {
        Self {
            run,
            path,
            now,
            default_timeout,
        }
    }

    /// Full path of the running test
    pub fn path(&self) -> &str {
        self.path
    }

    /// Current host tick
    pub fn tick(&self) -> u64 {
        self.now
    }

    /// Ticks since the current part started
    pub fn elapsed_ticks(&self) -> u64 {
        self.now.saturating_sub(self.run.tick_started)
    }

    pub fn is_async(&self) -> bool {
        self.run.is_async
    }

    /// Declare the test async. Without a timeout the configured default applies.
    pub fn async_test(&mut self, timeout: Option<u64>) {
        self.run.is_async = true;
        match timeout {
            Some(ticks) => {
                self.run.timeout = ticks;
                self.run.explicit_timeout = true;
            }
            None if !self.run.explicit_timeout => self.run.timeout = self.default_timeout,
            None => {}
        }
    }

    /// Mark an async test as complete
    pub fn done(&mut self) -> anyhow::Result<()> {
        if !self.run.is_async {
            anyhow::bail!("done() called on a test that was not declared async");
        }
        self.run.done = true;
        Ok(())
    }

    /// Run `f` on every tick until it returns [`TickControl::Stop`].
    /// Makes the test async with the default timeout if it is not already.
    pub fn on_tick<F>(&mut self, f: F)
    where
        F: FnMut(&mut TestContext<'_>, u64) -> anyhow::Result<TickControl> + 'static,
    {
        if !self.run.is_async {
            self.async_test(None);
        }
        self.run.tick_callbacks.push(Box::new(f));
    }

    /// Run `f` once, `ticks` ticks from now
    pub fn after_ticks<F>(&mut self, ticks: u64, f: F)
    where
        F: FnOnce(&mut TestContext<'_>) -> anyhow::Result<()> + 'static,
    {
        let target = self.elapsed_ticks() + ticks;
        let mut pending = Some(f);
        self.on_tick(move |ctx, elapsed| {
            if elapsed < target {
                return Ok(TickControl::Continue);
            }
            if let Some(f) = pending.take() {
                f(ctx)?;
            }
            Ok(TickControl::Stop)
        });
    }

    /// Run `f` when the test finishes, before afterEach hooks
    pub fn after_test<F>(&mut self, f: F)
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        self.run.after_test.push(Box::new(f));
    }
}

/// Invoke every registered tick callback once. The first callback error
/// fails the test; callbacks after it keep their registration.
pub(crate) fn run_tick_callbacks(run: &mut TestRun, path: &str, now: u64, default_timeout: u64) {
    let elapsed = now.saturating_sub(run.tick_started);
    let callbacks = std::mem::take(&mut run.tick_callbacks);
    let mut kept = Vec::with_capacity(callbacks.len());
    let mut failed = false;

    for mut callback in callbacks {
        if failed {
            kept.push(callback);
            continue;
        }
        let outcome = {
            let mut ctx = TestContext::new(run, path, now, default_timeout);
            guarded(|| callback(&mut ctx, elapsed))
        };
        match outcome {
            Ok(TickControl::Continue) => kept.push(callback),
            Ok(TickControl::Stop) => {}
            Err(error) => {
                run.errors.push(error);
                failed = true;
            }
        }
    }

    // Callbacks registered during this round run from the next tick on
    kept.append(&mut run.tick_callbacks);
    run.tick_callbacks = kept;
}

/// Run user code, turning both `Err` and panics into an error string
pub(crate) fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(format!("{error:#}")),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn run() -> TestRun {
        TestRun::new(crate::tree::TestTree::new().root())
    }

    #[test]
    fn test_done_requires_async() {
        let mut run = run();
        let mut ctx = TestContext::new(&mut run, "t", 0, 100);
        assert!(ctx.done().is_err());
        ctx.async_test(Some(5));
        assert!(ctx.done().is_ok());
        assert!(run.done);
        assert_eq!(run.timeout, 5);
    }

    #[test]
    fn test_on_tick_implies_async_with_default_timeout() {
        let mut run = run();
        let mut ctx = TestContext::new(&mut run, "t", 0, 100);
        ctx.on_tick(|_, _| Ok(TickControl::Stop));
        assert!(run.is_async);
        assert!(!run.explicit_timeout);
        assert_eq!(run.timeout, 100);
    }

    #[test]
    fn test_explicit_timeout_survives_implicit_async() {
        let mut run = run();
        let mut ctx = TestContext::new(&mut run, "t", 0, 100);
        ctx.async_test(Some(7));
        ctx.on_tick(|_, _| Ok(TickControl::Continue));
        ctx.async_test(None);
        assert_eq!(run.timeout, 7);
    }

    #[test]
    fn test_callbacks_deregister_on_stop() {
        let mut run = run();
        let calls = Rc::new(Cell::new(0));
        {
            let mut ctx = TestContext::new(&mut run, "t", 0, 100);
            let counter = calls.clone();
            ctx.on_tick(move |_, elapsed| {
                counter.set(counter.get() + 1);
                Ok(if elapsed >= 2 {
                    TickControl::Stop
                } else {
                    TickControl::Continue
                })
            });
        }
        for now in 1..=4 {
            run_tick_callbacks(&mut run, "t", now, 100);
        }
        assert_eq!(calls.get(), 2);
        assert!(run.tick_callbacks.is_empty());
    }

    #[test]
    fn test_after_ticks_fires_once() {
        let mut run = run();
        let fired = Rc::new(Cell::new(0u64));
        {
            let mut ctx = TestContext::new(&mut run, "t", 0, 100);
            let fired = fired.clone();
            ctx.after_ticks(3, move |ctx| {
                fired.set(ctx.tick());
                ctx.done()
            });
        }
        for now in 1..=5 {
            run_tick_callbacks(&mut run, "t", now, 100);
        }
        assert_eq!(fired.get(), 3);
        assert!(run.done);
    }

    #[test]
    fn test_callback_error_is_recorded() {
        let mut run = run();
        {
            let mut ctx = TestContext::new(&mut run, "t", 0, 100);
            ctx.on_tick(|_, _| anyhow::bail!("bad tick"));
        }
        run_tick_callbacks(&mut run, "t", 1, 100);
        assert_eq!(run.errors, vec!["bad tick".to_string()]);
    }

    #[test]
    fn test_guarded_catches_panics() {
        let result: Result<(), String> = guarded(|| panic!("kaboom"));
        assert_eq!(result, Err("panicked: kaboom".to_string()));
    }
}
