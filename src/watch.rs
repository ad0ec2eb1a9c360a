//! Watch Mode: re-run the suite on file changes
//!
//! Changed paths are made relative to the watch root, normalized to `/`
//! separators and matched against the configured globs. A burst of
//! matching events is coalesced by [`Debouncer`]; every new match pushes
//! the deadline out again. Each trigger starts a fresh supervised run.

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use glob::{MatchOptions, Pattern};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Clear terminal screen (ANSI escape codes)
pub fn clear_screen() {
    eprint!("\x1B[2J\x1B[1;1H");
}

/// Normalized glob set, matched against root-relative paths
#[derive(Debug, Clone)]
pub struct WatchPatterns {
    root: PathBuf,
    patterns: Vec<Pattern>,
}

impl WatchPatterns {
    pub fn new<S: AsRef<str>>(root: &Path, patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let normalized = normalize(p.as_ref());
                let normalized = normalized.trim_start_matches("./");
                Pattern::new(normalized).map_err(|e| Error::pattern(p.as_ref(), e))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            root: root.to_path_buf(),
            patterns,
        })
    }

    /// Whether a changed path should trigger a run
    pub fn matches(&self, path: &Path) -> bool {
        if is_ignored_path(path) {
            return false;
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let candidate = normalize(&relative.to_string_lossy());
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.patterns
            .iter()
            .any(|p| p.matches_with(&candidate, options))
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// Check if a path should be ignored
pub fn is_ignored_path(path: &Path) -> bool {
    let path_str = normalize(&path.to_string_lossy());

    path_str.contains("/.git/")
        || path_str.starts_with(".git/")
        || path_str.contains("/target/")
        || path_str.starts_with("target/")
        || path_str.contains(".tickrun/")
}

/// Deadline-based debounce: `trigger` arms or re-arms, `fire` reports once
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    /// Time left before the pending trigger fires
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// True once per trigger, after the window passes without a new trigger
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Start the watch loop - blocks until the run callback asks to stop
/// or the watcher goes away.
///
/// `run_session` returns `Ok(true)` to keep watching.
pub fn start_watch_loop<F>(root: &Path, patterns: &WatchPatterns, mut run_session: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let (tx, rx) = unbounded();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    tracing::info!("watching for changes in {}", root.display());
    eprintln!("[tickrun] Watching for changes in {}", root.display());
    eprintln!("[tickrun] Press Ctrl+C to stop.\n");

    if !run_session()? {
        return Ok(());
    }

    let mut debouncer = Debouncer::new(DEFAULT_DEBOUNCE);
    let mut changed: Vec<PathBuf> = Vec::new();
    let idle = Duration::from_millis(250);

    loop {
        let wait = debouncer.remaining(Instant::now()).unwrap_or(idle);
        match rx.recv_timeout(wait) {
            Ok(event) => {
                if !is_change(&event.kind) {
                    continue;
                }
                let matching: Vec<PathBuf> = event
                    .paths
                    .into_iter()
                    .filter(|p| patterns.matches(p))
                    .collect();
                if !matching.is_empty() {
                    tracing::debug!(paths = ?matching, "matching change");
                    changed.extend(matching);
                    debouncer.trigger(Instant::now());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if crate::signals::shutdown_requested() {
            debouncer.cancel();
            break;
        }

        if debouncer.fire(Instant::now()) {
            clear_screen();
            eprintln!(
                "[tickrun] Change detected in {} file(s). Re-running...\n",
                changed.len()
            );
            changed.clear();
            if !run_session()? {
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ignored_path() {
        assert!(is_ignored_path(Path::new("project/.git/index")));
        assert!(is_ignored_path(Path::new("target/debug/tickrun")));
        assert!(is_ignored_path(Path::new("/work/target/debug/build")));
        assert!(is_ignored_path(Path::new("/work/.tickrun/test-results.json")));
        assert!(!is_ignored_path(Path::new("src/targets.rs")));
        assert!(!is_ignored_path(Path::new("tests/world.rs")));
    }

    #[test]
    fn test_patterns_match_relative_to_root() {
        let root = Path::new("/work/game");
        let patterns = WatchPatterns::new(root, &["./src/**", "assets/*.json"]).unwrap();
        assert!(patterns.matches(Path::new("/work/game/src/world/map.rs")));
        assert!(patterns.matches(Path::new("/work/game/assets/items.json")));
        assert!(!patterns.matches(Path::new("/work/game/assets/deep/items.json")));
        assert!(!patterns.matches(Path::new("/work/game/README.md")));
        assert!(!patterns.matches(Path::new("/work/game/src/.git/x")));
    }

    #[test]
    fn test_backslash_patterns_are_normalized() {
        let patterns = WatchPatterns::new(Path::new("/w"), &["src\\*.rs"]).unwrap();
        assert!(patterns.matches(Path::new("/w/src/lib.rs")));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let err = WatchPatterns::new(Path::new("/w"), &["src/[**"]).unwrap_err();
        assert!(matches!(err, Error::Pattern { .. }));
    }

    #[test]
    fn test_debouncer_coalesces_bursts() {
        let start = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(300));
        assert!(!d.fire(start));

        d.trigger(start);
        d.trigger(start + Duration::from_millis(200));
        assert!(!d.fire(start + Duration::from_millis(400)));
        assert_eq!(
            d.remaining(start + Duration::from_millis(400)),
            Some(Duration::from_millis(100))
        );
        assert!(d.fire(start + Duration::from_millis(500)));
        assert!(!d.fire(start + Duration::from_millis(900)));
        assert!(!d.is_pending());
    }

    #[test]
    fn test_debouncer_cancel() {
        let start = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(10));
        d.trigger(start);
        d.cancel();
        assert!(!d.fire(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_only_content_changes_count() {
        use notify::event::{AccessKind, ModifyKind};
        assert!(is_change(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_change(&EventKind::Access(AccessKind::Any)));
    }

    #[test]
    fn test_matching_burst_triggers_one_rerun() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let patterns = WatchPatterns::new(&root, &["*.rs"]).unwrap();

        let mut runs = 0;
        let mut rerun_after = Duration::ZERO;
        let started = Instant::now();
        start_watch_loop(&root, &patterns, || {
            runs += 1;
            if runs == 1 {
                std::fs::write(root.join("notes.txt"), "ignored").unwrap();
                let burst = root.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(700));
                    std::fs::write(burst.join("a.rs"), "fn a() {}").unwrap();
                    std::fs::write(burst.join("b.rs"), "fn b() {}").unwrap();
                });
                return Ok(true);
            }
            rerun_after = started.elapsed();
            Ok(false)
        })
        .unwrap();

        assert_eq!(runs, 2);
        // Neither notes.txt nor the undebounced burst may start the rerun
        assert!(rerun_after >= Duration::from_millis(700) + DEFAULT_DEBOUNCE);
    }
}
