//! The Supervisor: owns the listener, runs the accept loop, consumes
//! lifecycle events, and orchestrates draining and restart handover (§4.5).
//!
//! Grounded in the daemon crate's own server module — a bind-then-serve
//! loop guarded by a PID file, with `cleanup()` run on every exit path —
//! generalized here into an explicit state machine so restart and forced
//! stop are first-class transitions instead of ad hoc branches.

pub mod dispatch;
pub mod restart;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BindSpec, ServerConfig};
use crate::errors::{Result, ServerError};
use crate::handler::ConnectionHandler;
use crate::listener::Listener;
use crate::pid;
use crate::registry::{ConnectionRegistry, WaitOutcome};
use crate::signals::{self, LifecycleEvent};

/// Environment variable names that carry an inherited listener across a
/// restart handover (§6).
pub const ENV_INHERITED_FD: &str = "SERVER_INHERITED_FD";
pub const ENV_INHERITED_KIND: &str = "SERVER_INHERITED_KIND";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Draining,
    Restarting,
    Terminating,
}

/// Build the listener for this process: fresh if no inheritance variables
/// are set, otherwise reconstructed around the inherited fd (§6).
fn acquire_listener_spec(config: &ServerConfig) -> Result<(BindSpec, Option<std::os::fd::RawFd>)> {
    let spec = config.bind_spec()?;

    let fd_var = std::env::var(ENV_INHERITED_FD).ok();
    let kind_var = std::env::var(ENV_INHERITED_KIND).ok();

    match (fd_var, kind_var) {
        (None, None) => Ok((spec, None)),
        (Some(fd_str), Some(kind)) => {
            if kind != spec.kind() {
                return Err(ServerError::InheritFailed(format!(
                    "inherited listener kind {kind:?} does not match configured bind scheme {:?}",
                    spec.kind()
                )));
            }
            let fd = fd_str
                .parse::<std::os::fd::RawFd>()
                .map_err(|e| ServerError::InheritFailed(format!("invalid {ENV_INHERITED_FD} {fd_str:?}: {e}")))?;
            Ok((spec, Some(fd)))
        }
        _ => Err(ServerError::InheritFailed(format!(
            "{ENV_INHERITED_FD} and {ENV_INHERITED_KIND} must both be set or both be absent"
        ))),
    }
}

/// Cancel the accept loop, wait for it to actually return (so its own
/// `Arc<Listener>` clone is dropped), then drop our remaining reference.
/// Once this returns, the predecessor's copy of the listener fd is closed —
/// not just idle — so the OS refuses new connections on a pure shutdown
/// (§4.5, §5). Only unlinks the UNIX path when `unlink` is set: a restart
/// predecessor must never unlink a path its successor is about to reuse.
async fn close_listener(
    accept_shutdown: &CancellationToken,
    accept_task: &mut Option<tokio::task::JoinHandle<()>>,
    listener: &mut Option<Arc<Listener>>,
    unlink: bool,
) {
    accept_shutdown.cancel();
    if let Some(task) = accept_task.take() {
        let _ = task.await;
    }
    if let Some(listener) = listener.take() {
        if unlink {
            listener.unlink_if_unix();
        }
    }
}

/// Run the supervisor to completion. Returns `Ok(())` on every graceful
/// exit path (idle stop, drained stop, forced stop, or a restart
/// predecessor handing off); returns `Err` only for the startup-fatal
/// variants of §7, which the caller should map to a non-zero exit code.
pub async fn run(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
    let (spec, inherited_fd) = acquire_listener_spec(&config)?;

    let listener = match inherited_fd {
        Some(fd) => {
            info!(event = "supervisor.startup.inherited", kind = spec.kind());
            Listener::inherit_from(fd, &spec)?
        }
        None => {
            info!(event = "supervisor.startup.bound_fresh", kind = spec.kind());
            Listener::bind_and_listen(&spec).await?
        }
    };
    let listener = Arc::new(listener);

    let own_pid = std::process::id();
    pid::write(&config.pid_path, own_pid)?;

    let registry = ConnectionRegistry::new();
    let mut events = signals::install();
    let accept_shutdown = CancellationToken::new();

    let mut accept_task = Some(tokio::spawn(dispatch::run_accept_loop(
        listener.clone(),
        handler,
        registry.clone(),
        config.allowed_networks.clone(),
        accept_shutdown.clone(),
    )));
    let mut listener = Some(listener);

    let mut state = State::Running;
    let mut restart_handed_off = false;

    loop {
        state = match state {
            State::Running => {
                match events.recv().await {
                    Some(LifecycleEvent::StopRequested) => {
                        info!(event = "supervisor.state.draining");
                        close_listener(&accept_shutdown, &mut accept_task, &mut listener, true).await;
                        State::Draining
                    }
                    Some(LifecycleEvent::RestartRequested) => {
                        info!(event = "supervisor.state.restarting");
                        let listener_ref = listener.as_ref().expect("listener present while Running");
                        match restart::handover(&config, listener_ref, own_pid).await {
                            Ok(restart::HandoverOutcome::Succeeded { successor_pid }) => {
                                info!(event = "supervisor.restart.predecessor_draining", successor_pid);
                                restart_handed_off = true;
                                // The successor already holds its own copy of
                                // the listener fd; the predecessor just stops
                                // accepting and keeps its own fd open until
                                // it exits (no unlink, no early close).
                                accept_shutdown.cancel();
                                State::Restarting
                            }
                            Ok(restart::HandoverOutcome::Aborted) => {
                                warn!(event = "supervisor.restart.aborted");
                                State::Running
                            }
                            Err(e) => {
                                warn!(event = "supervisor.restart.failed", error = %e);
                                State::Running
                            }
                        }
                    }
                    Some(LifecycleEvent::ForceStopRequested) => {
                        warn!(event = "supervisor.state.force_terminating");
                        close_listener(&accept_shutdown, &mut accept_task, &mut listener, true).await;
                        State::Terminating
                    }
                    None => {
                        error!(event = "supervisor.signals.channel_closed");
                        close_listener(&accept_shutdown, &mut accept_task, &mut listener, true).await;
                        State::Terminating
                    }
                }
            }
            State::Draining | State::Restarting => {
                tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Some(LifecycleEvent::ForceStopRequested) => {
                            warn!(event = "supervisor.state.force_terminating");
                            State::Terminating
                        }
                        Some(LifecycleEvent::RestartRequested) | Some(LifecycleEvent::StopRequested) => {
                            // Already stopping: further stop/restart requests are no-ops (§4.5).
                            state
                        }
                        None => State::Terminating,
                    },
                    outcome = registry.wait_until_empty(config.drain_timeout) => {
                        match outcome {
                            WaitOutcome::Drained => info!(event = "supervisor.drain.completed"),
                            WaitOutcome::DeadlineExceeded => warn!(event = "supervisor.drain.deadline_exceeded"),
                        }
                        State::Terminating
                    }
                }
            }
            State::Terminating => break,
        };
    }

    // A no-op if `close_listener` already ran above (pure-shutdown paths);
    // for a completed restart handover this just joins the accept task and
    // drops the predecessor's own fd reference without touching the path.
    close_listener(&accept_shutdown, &mut accept_task, &mut listener, !restart_handed_off).await;

    if !restart_handed_off {
        pid::remove(&config.pid_path)?;
    }

    info!(event = "supervisor.shutdown.completed", restart_handed_off);
    Ok(())
}
