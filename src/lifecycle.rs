//! Host process lifecycle
//!
//! [`HostGuard`] owns the kill for one supervised host. The watchdog, a
//! cancellation request and normal shutdown may all ask for it; only the
//! first request sends signals. Drop kills too, so a panic or early return
//! in the supervisor never leaks a host.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct HostGuard {
    pid: i32,
    /// Set once the host is killed or known to have exited
    finished: AtomicBool,
}

impl HostGuard {
    /// `pid` must lead its own process group
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            finished: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Kill the host's whole process group. Returns false if a kill was
    /// already sent or the host had exited.
    pub fn kill(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.pid > 0 {
            // Group first so children the host spawned go too
            let _ = kill(Pid::from_raw(-self.pid), Signal::SIGKILL);
            let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
            tracing::debug!(pid = self.pid, "killed host process group");
        }
        true
    }

    /// The host exited on its own; Drop must not signal a reused pid
    pub fn mark_exited(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_kill_is_idempotent() {
        let guard = HostGuard::new(0);
        assert!(guard.kill());
        assert!(!guard.kill());
        assert!(guard.is_finished());
    }

    #[test]
    fn test_mark_exited_suppresses_kill() {
        let guard = HostGuard::new(0);
        guard.mark_exited();
        assert!(!guard.kill());
    }

    #[test]
    fn test_kill_terminates_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let guard = HostGuard::new(child.id() as i32);
        assert!(guard.kill());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
