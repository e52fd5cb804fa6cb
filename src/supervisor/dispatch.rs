//! Handler Dispatch Glue (§4.6): per-connection registration, handler
//! invocation, and deregistration, run off the accept loop so one slow
//! handler or handshake never stalls another connection.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AllowList;
use crate::errors::ServerError;
use crate::handler::ConnectionHandler;
use crate::listener::{complete_tls_handshake, Accepted, Listener};
use crate::registry::ConnectionRegistry;

const TRANSIENT_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Runs until `shutdown` is cancelled, at which point the pending `accept`
/// is abandoned and the loop returns (§4.5.1 "AcceptInterrupted").
pub async fn run_accept_loop(
    listener: Arc<Listener>,
    handler: Arc<dyn ConnectionHandler>,
    registry: ConnectionRegistry,
    allowed_networks: AllowList,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(event = "supervisor.accept_loop.interrupted");
                return;
            }
            result = listener.accept() => {
                match result {
                    Ok(Accepted::Ready { stream, remote_address }) => {
                        if let Some(addr) = remote_address {
                            if !allowed_networks.allows(&addr.ip()) {
                                warn!(event = "supervisor.dispatch.remote_disallowed", remote = %addr);
                                continue;
                            }
                        }
                        spawn_worker(stream, remote_address, handler.clone(), registry.clone()).await;
                    }
                    Ok(Accepted::PendingTls { tcp, acceptor, remote_address }) => {
                        if !allowed_networks.allows(&remote_address.ip()) {
                            warn!(event = "supervisor.dispatch.remote_disallowed", remote = %remote_address);
                            continue;
                        }
                        let handler = handler.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            match complete_tls_handshake(tcp, acceptor).await {
                                Ok(stream) => spawn_worker(stream, Some(remote_address), handler, registry).await,
                                Err(e) => {
                                    warn!(
                                        event = "supervisor.dispatch.tls_handshake_failed",
                                        remote = %remote_address,
                                        error = %ServerError::TlsHandshakeFailed(e),
                                    );
                                }
                            }
                        });
                    }
                    Err(ServerError::AcceptTransient(e)) => {
                        warn!(event = "supervisor.dispatch.accept_transient", error = %e);
                        tokio::time::sleep(TRANSIENT_ACCEPT_BACKOFF).await;
                    }
                    Err(e) => {
                        warn!(event = "supervisor.dispatch.accept_error", error = %e);
                        tokio::time::sleep(TRANSIENT_ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

async fn spawn_worker(
    stream: crate::listener::Stream,
    remote_address: Option<std::net::SocketAddr>,
    handler: Arc<dyn ConnectionHandler>,
    registry: ConnectionRegistry,
) {
    let id = registry.register(remote_address).await;
    tokio::spawn(async move {
        let address = remote_address.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
        if let Err(e) = handler.handle(stream, address).await {
            warn!(event = "supervisor.dispatch.handler_failed", connection_id = id, error = %ServerError::HandlerFailed(e.to_string()));
        }
        registry.deregister(id).await;
    });
}
