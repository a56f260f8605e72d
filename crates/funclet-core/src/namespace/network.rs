//! Scoped entry into a container's network namespace.
//!
//! `setns(2)` switches only the calling thread. [`NetnsGuard`] records the
//! thread's namespace before switching and restores it when dropped, on
//! every exit path including errors and panics. Child processes spawned
//! while the guard is alive inherit the container's namespace.

use std::fs::File;
use std::path::PathBuf;

use funclet_common::error::{FuncletError, Result};
use nix::sched::{CloneFlags, setns};

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Holds the calling thread inside another process's network namespace.
#[derive(Debug)]
pub struct NetnsGuard {
    original: File,
    pid: i32,
}

impl NetnsGuard {
    /// Moves the calling thread into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if either namespace handle cannot be opened or if
    /// `setns(2)` fails. The thread is left in its original namespace.
    pub fn enter(pid: i32) -> Result<Self> {
        let original = File::open(THREAD_NETNS).map_err(|e| FuncletError::io(THREAD_NETNS, e))?;
        let target_path = PathBuf::from(format!("/proc/{pid}/ns/net"));
        let target = File::open(&target_path).map_err(|e| FuncletError::io(&target_path, e))?;
        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| FuncletError::Network {
            message: format!("setns into netns of pid {pid} failed: {e}"),
        })?;
        tracing::debug!(pid, "entered network namespace");
        Ok(Self { original, pid })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match setns(&self.original, CloneFlags::CLONE_NEWNET) {
            Ok(()) => tracing::debug!(pid = self.pid, "restored network namespace"),
            Err(e) => tracing::error!(pid = self.pid, error = %e, "failed to restore network namespace"),
        }
    }
}

/// Runs `f` inside the network namespace of `pid` and restores the
/// original namespace afterwards, whether `f` succeeds or not.
///
/// # Errors
///
/// Returns an error if the namespace cannot be entered, or the error
/// returned by `f`.
pub fn with_netns<T>(pid: i32, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = NetnsGuard::enter(pid)?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entering_missing_pid_fails_cleanly() {
        let err = NetnsGuard::enter(i32::MAX).unwrap_err();
        assert!(matches!(err, FuncletError::Io { .. }));
    }

    #[test]
    fn with_netns_does_not_run_closure_on_enter_failure() {
        let mut ran = false;
        let result = with_netns(i32::MAX, || {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);
    }
}
