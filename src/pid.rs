//! PID file management.
//!
//! Writes are atomic (write-then-rename) so a reader never observes a
//! truncated file. Liveness is checked with a zero-signal `kill`, which
//! reports whether a process exists without disturbing it.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::Result;

/// Write `pid` to `path` atomically via write-then-rename.
pub fn write(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("pid.tmp");
    std::fs::write(&tmp_path, format!("{pid}\n"))?;
    std::fs::rename(&tmp_path, path)?;
    debug!(event = "supervisor.pidfile.written", pid, path = %path.display());
    Ok(())
}

/// Read the PID from `path`. Parses the leading digits and ignores
/// surrounding whitespace; returns `None` if the file is missing, empty, or
/// does not start with a digit.
pub fn read(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let digits: String = contents.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u32>().ok()
}

/// Remove the PID file. Absence is not an error.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(event = "supervisor.pidfile.removed", path = %path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a process with the given PID is currently alive.
///
/// Uses `kill(pid, 0)`, which checks existence without sending a signal.
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // EPERM means the process exists but we lack permission to signal it.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Read the PID file and return `Some(pid)` only if that process is alive.
/// A stale file (dead PID) is left untouched; callers that own the file
/// decide whether to clear it.
pub fn check_running(path: &Path) -> Option<u32> {
    let pid = read(path)?;
    if is_alive(pid) {
        Some(pid)
    } else {
        warn!(event = "supervisor.pidfile.stale_detected", pid, path = %path.display());
        None
    }
}

/// Poll `path` until it holds a PID different from `predecessor_pid`, or
/// `timeout` elapses. Used by restart handover (§4.5.2 step 3) to detect
/// successor readiness.
pub fn poll_for_new_pid(path: &Path, predecessor_pid: u32, timeout: Duration) -> Option<u32> {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    let start = Instant::now();
    loop {
        if let Some(pid) = read(path) {
            if pid != predecessor_pid {
                return Some(pid);
            }
        }
        if start.elapsed() >= timeout {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Async counterpart of `poll_for_new_pid`, for use from the supervisor's
/// own task instead of blocking a worker thread.
pub async fn poll_for_new_pid_async(path: &Path, predecessor_pid: u32, timeout: Duration) -> Option<u32> {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(pid) = read(path) {
            if pid != predecessor_pid {
                return Some(pid);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
