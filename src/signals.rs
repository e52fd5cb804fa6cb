//! Signal Router: installs OS signal handlers and converts them into
//! lifecycle events delivered to the supervisor over a channel.
//!
//! `tokio::signal::unix` already does the "enqueue only, do no work inside
//! the handler" part for us — each `.recv()` simply resolves a future when
//! the signal arrives, so there is nothing left that could block inside an
//! OS signal handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

/// Events the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StopRequested,
    ForceStopRequested,
    RestartRequested,
}

/// Spawns the task that owns the OS signal streams and emits
/// `LifecycleEvent`s. Returns the receiving half; the task runs until the
/// sender is dropped (i.e. for the life of the process).
pub fn install() -> mpsc::UnboundedReceiver<LifecycleEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(event = "supervisor.signals.install_failed", signal = "SIGTERM", error = %e);
                return;
            }
        };
        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(event = "supervisor.signals.install_failed", signal = "SIGUSR1", error = %e);
                return;
            }
        };

        // First graceful-stop emits StopRequested; any further occurrence is
        // the "second hit" that forces immediate termination (§4.3).
        let stop_seen = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    if stop_seen.swap(true, Ordering::SeqCst) {
                        info!(event = "supervisor.signals.received", signal = "SIGTERM", occurrence = "second");
                        if tx.send(LifecycleEvent::ForceStopRequested).is_err() {
                            break;
                        }
                    } else {
                        info!(event = "supervisor.signals.received", signal = "SIGTERM", occurrence = "first");
                        if tx.send(LifecycleEvent::StopRequested).is_err() {
                            break;
                        }
                    }
                }
                _ = sigusr1.recv() => {
                    info!(event = "supervisor.signals.received", signal = "SIGUSR1");
                    // Idempotent: once a restart is already in flight, a second
                    // SIGUSR1 is a no-op (§4.5 Draining/Restarting ignore it).
                    if tx.send(LifecycleEvent::RestartRequested).is_err() {
                        break;
                    }
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_then_sigterm_escalates_to_force_stop() {
        let mut rx = install();
        // give the spawned task a moment to install its handlers
        tokio::time::sleep(Duration::from_millis(50)).await;

        signal::kill(Pid::this(), Signal::SIGTERM).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(LifecycleEvent::StopRequested));

        signal::kill(Pid::this(), Signal::SIGTERM).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(second, Some(LifecycleEvent::ForceStopRequested));
    }

    #[tokio::test]
    async fn sigusr1_emits_restart_requested() {
        let mut rx = install();
        tokio::time::sleep(Duration::from_millis(50)).await;

        signal::kill(Pid::this(), Signal::SIGUSR1).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(event, Some(LifecycleEvent::RestartRequested));
    }
}
