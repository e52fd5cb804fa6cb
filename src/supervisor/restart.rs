//! Restart handover (§4.5.2): mark the listener fd inheritable, exec a
//! successor with the fd identity passed via environment, and wait for it
//! to take over the PID file.

use std::time::Duration;

use tracing::{error, info};

use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};
use crate::listener::{mark_inheritable, Listener};
use crate::pid;

/// Bounded wait for the successor to signal readiness (§4.5.2 step 3).
pub const HANDOVER_TIMEOUT: Duration = Duration::from_secs(5);

pub enum HandoverOutcome {
    /// The successor rewrote the PID file with its own (different) PID.
    Succeeded { successor_pid: u32 },
    /// The successor never showed up in time; the predecessor keeps the
    /// listener and remains `Running`.
    Aborted,
}

/// Spawn a successor inheriting `listener`'s fd, then poll the PID file for
/// its takeover. Never closes `listener`: ownership is transferred, not
/// revoked, and the predecessor keeps accepting if the handover fails.
pub async fn handover(config: &ServerConfig, listener: &Listener, own_pid: u32) -> Result<HandoverOutcome> {
    let fd = listener.underlying_fd();
    mark_inheritable(fd)?;

    let (program, args) = config
        .start_command
        .split_first()
        .ok_or_else(|| ServerError::ConfigInvalid("start_command must not be empty".into()))?;

    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .env("SERVER_INHERITED_FD", fd.to_string())
        .env("SERVER_INHERITED_KIND", listener.kind());

    let child = command.spawn().map_err(|e| ServerError::RestartHandoverFailed(format!("failed to spawn successor: {e}")))?;
    info!(event = "supervisor.restart.successor_spawned", pid = child.id());

    match pid::poll_for_new_pid_async(&config.pid_path, own_pid, HANDOVER_TIMEOUT).await {
        Some(successor_pid) => {
            info!(event = "supervisor.restart.handover_completed", successor_pid);
            Ok(HandoverOutcome::Succeeded { successor_pid })
        }
        None => {
            error!(event = "supervisor.restart.handover_timed_out", own_pid);
            // The PID file must never point at a dead process: reassert our
            // own ownership in case the successor partially wrote it.
            pid::write(&config.pid_path, own_pid)?;
            Ok(HandoverOutcome::Aborted)
        }
    }
}
