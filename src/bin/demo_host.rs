//! Example host process for `tickrun`
//!
//! Owns a tiny "world" advanced by its own tick handler and runs a small
//! suite against it. Reads its [`TestConfig`] from `TICKRUN_CONFIG` and
//! checkpoints into `TICKRUN_STATE_DIR` (a fresh temp dir by default).
//! Setting `DEMO_HOST_FAIL` adds a failing test.

use std::cell::Cell;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use tickrun::builder::Source;
use tickrun::config::TestConfig;
use tickrun::context::TickControl;
use tickrun::host::{FileStore, HostLoop};
use tickrun::{logging, signals};

fn sources(world: Rc<Cell<u64>>, fail: bool) -> Vec<Source> {
    vec![
        Source::new("basics", move |s| {
            s.test("Pass", |_| Ok(()));
            s.test("Skip", |_| anyhow::bail!("skipped tests never run"))
                .skip();
            s.todo("TODO");
            s.test_each("each {}", [1, 2], |_, n| {
                anyhow::ensure!(*n > 0, "case {n} must be positive");
                Ok(())
            });
            if fail {
                s.test("Fails", |_| {
                    println!("about to fail");
                    anyhow::bail!("intentional failure")
                });
            }
            Ok(())
        }),
        Source::new("world", move |s| {
            let world = world.clone();
            s.test("In world", move |ctx| {
                let start = world.get();
                let world = world.clone();
                ctx.after_ticks(3, move |ctx| {
                    anyhow::ensure!(world.get() >= start + 3, "world did not advance");
                    ctx.done()
                });
                Ok(())
            });
            s.test("waits for ticks", |ctx| {
                ctx.async_test(Some(100));
                ctx.on_tick(|ctx, elapsed| {
                    if elapsed < 2 {
                        return Ok(TickControl::Continue);
                    }
                    ctx.done()?;
                    Ok(TickControl::Stop)
                });
                Ok(())
            });
            s.test("survives reload", |_| {
                println!("before reload");
                Ok(())
            })
            .after_reload(|_| {
                println!("after reload");
                Ok(())
            });
            Ok(())
        }),
    ]
}

fn main() -> ExitCode {
    logging::init_host();
    if let Err(e) = signals::install_signal_handlers() {
        tracing::warn!("signal handlers not installed: {}", e);
    }

    let config = match TestConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("demo_host: {e}");
            return ExitCode::FAILURE;
        }
    };

    let explicit_state = env::var_os("TICKRUN_STATE_DIR").map(PathBuf::from);
    let state_dir = explicit_state
        .clone()
        .unwrap_or_else(|| env::temp_dir().join(format!("tickrun-demo-{}", std::process::id())));
    let fail = env::var_os("DEMO_HOST_FAIL").is_some();

    let world = Rc::new(Cell::new(0u64));
    let ticker = world.clone();
    let mut host = HostLoop::new(sources(world, fail), config, FileStore::new(&state_dir))
        .on_tick(move |_| ticker.set(ticker.get() + 1));

    let result = host.run();
    if explicit_state.is_none() {
        let _ = std::fs::remove_dir_all(&state_dir);
    }
    match result {
        Ok(status) if status.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("demo_host: {e}");
            ExitCode::FAILURE
        }
    }
}
