//! Connection Registry: the set of currently-serving connections.
//!
//! The sole piece of shared mutable state in the supervisor (§5). Guarded by
//! a `tokio::sync::Mutex` and paired with a `Notify` so `wait_until_empty`
//! parks instead of busy-waiting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

/// Unique within the process lifetime; a monotonic counter is sufficient.
pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// `None` for UNIX-domain peers, which have no IP address (§4.1).
    pub remote_address: Option<SocketAddr>,
}

/// Outcome of `wait_until_empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Drained,
    DeadlineExceeded,
}

struct Inner {
    connections: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
    next_id: AtomicU64,
    empty_notify: Notify,
}

/// Handle to the shared registry. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                empty_notify: Notify::new(),
            }),
        }
    }

    /// Register a newly-accepted connection and return its id.
    pub async fn register(&self, remote_address: Option<SocketAddr>) -> ConnectionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.inner.connections.lock().await;
        connections.insert(id, ConnectionInfo { id, remote_address });
        id
    }

    /// Deregister a connection once its handler has returned (success or
    /// failure). Wakes any `wait_until_empty` caller if this was the last
    /// connection.
    pub async fn deregister(&self, id: ConnectionId) {
        let mut connections = self.inner.connections.lock().await;
        connections.remove(&id);
        if connections.is_empty() {
            self.inner.empty_notify.notify_waiters();
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Block until `count() == 0` or `deadline` elapses. `None` blocks
    /// indefinitely.
    pub async fn wait_until_empty(&self, deadline: Option<Duration>) -> WaitOutcome {
        loop {
            if self.count().await == 0 {
                return WaitOutcome::Drained;
            }

            // Subscribe before re-checking the count to avoid a notify
            // arriving between the check above and the wait below.
            let notified = self.inner.empty_notify.notified();
            if self.count().await == 0 {
                return WaitOutcome::Drained;
            }

            match deadline {
                None => notified.await,
                Some(d) => {
                    if tokio::time::timeout(d, notified).await.is_err() {
                        return WaitOutcome::DeadlineExceeded;
                    }
                }
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> Option<SocketAddr> {
        Some("127.0.0.1:9".parse().unwrap())
    }

    #[tokio::test]
    async fn register_and_count() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.count().await, 0);
        let id1 = registry.register(addr()).await;
        let id2 = registry.register(addr()).await;
        assert_ne!(id1, id2);
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn deregister_decrements_count() {
        let registry = ConnectionRegistry::new();
        let id = registry.register(addr()).await;
        assert_eq!(registry.count().await, 1);
        registry.deregister(id).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn wait_until_empty_returns_immediately_when_already_empty() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.wait_until_empty(Some(Duration::from_millis(10))).await;
        assert_eq!(outcome, WaitOutcome::Drained);
    }

    #[tokio::test]
    async fn wait_until_empty_unblocks_on_deregister() {
        let registry = ConnectionRegistry::new();
        let id = registry.register(addr()).await;

        let waiter_registry = registry.clone();
        let waiter = tokio::spawn(async move { waiter_registry.wait_until_empty(None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.deregister(id).await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_until_empty should have returned")
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Drained);
    }

    #[tokio::test]
    async fn wait_until_empty_times_out_when_still_occupied() {
        let registry = ConnectionRegistry::new();
        let _id = registry.register(addr()).await;
        let outcome = registry.wait_until_empty(Some(Duration::from_millis(50))).await;
        assert_eq!(outcome, WaitOutcome::DeadlineExceeded);
    }
}
