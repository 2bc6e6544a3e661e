//! Live session bookkeeping.
//!
//! The registry is used for accounting and shutdown draining only. Relaying
//! never consults it, so a slow removal cannot affect other sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::protocol::TargetAddr;
use crate::proxy::RelayMetrics;
use crate::server::ServerMetrics;

/// Unique session identifier.
pub type SessionId = u64;

/// Relay-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, key not yet sent
    AwaitingHandshake,
    /// Key sent, waiting for the target declaration
    KeySent,
    /// Target declared, connecting to it
    TargetReceived,
    /// Both connections open, relay loop running
    Relaying,
    /// Both connections closed
    Closed,
}

/// One live session as seen by the registry.
pub struct SessionRecord {
    id: SessionId,
    peer: SocketAddr,
    created_at: Instant,
    state: Mutex<SessionState>,
    target: Mutex<Option<TargetAddr>>,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
    metrics: Arc<ServerMetrics>,
}

impl SessionRecord {
    fn new(id: SessionId, peer: SocketAddr, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            id,
            peer,
            created_at: Instant::now(),
            state: Mutex::new(SessionState::AwaitingHandshake),
            target: Mutex::new(None),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
            metrics,
        }
    }

    /// Get session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Get session state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `state`.
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Record the declared target.
    pub fn set_target(&self, target: TargetAddr) {
        *self.target.lock() = Some(target);
    }

    /// Get session statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            peer: self.peer,
            state: self.state(),
            target: self.target.lock().as_ref().map(ToString::to_string),
            age: self.created_at.elapsed(),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }
}

// On the relay node the plaintext side is the target: opened bytes go
// upstream to it, sealed bytes go back downstream to the client.
impl RelayMetrics for SessionRecord {
    fn record_sealed(&self, bytes: u64) {
        self.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
        self.metrics.add_bytes_downstream(bytes);
    }

    fn record_opened(&self, bytes: u64) {
        self.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
        self.metrics.add_bytes_upstream(bytes);
    }
}

/// Session statistics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub target: Option<String>,
    pub age: Duration,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

/// Tracks every live session on the relay node.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionRecord>>>,
    next_id: AtomicU64,
    max_sessions: usize,
    drained: Notify,
}

impl SessionRegistry {
    /// Create a registry admitting at most `max_sessions` live sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
            drained: Notify::new(),
        }
    }

    /// Register a new session, or `None` when the registry is full.
    ///
    /// The entry is removed when the returned guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        peer: SocketAddr,
        metrics: Arc<ServerMetrics>,
    ) -> Option<SessionGuard> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(SessionRecord::new(id, peer, metrics));
        sessions.insert(id, Arc::clone(&record));

        Some(SessionGuard {
            registry: Arc::clone(self),
            record,
        })
    }

    /// Get a session by ID.
    pub fn get(&self, id: SessionId) -> Option<Arc<SessionRecord>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Get session count.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Get statistics for all sessions.
    pub fn all_stats(&self) -> Vec<SessionStats> {
        self.sessions.read().values().map(|s| s.stats()).collect()
    }

    /// Wait until no sessions remain, up to `timeout`. Returns whether the
    /// registry drained in time.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drain).await.is_ok()
    }

    fn remove(&self, id: SessionId) {
        let mut sessions = self.sessions.write();
        sessions.remove(&id);
        if sessions.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

/// Keeps a session registered for as long as it is alive.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    record: Arc<SessionRecord>,
}

impl SessionGuard {
    /// The registered record.
    pub fn record(&self) -> &Arc<SessionRecord> {
        &self.record
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.record.set_state(SessionState::Closed);
        self.registry.remove(self.record.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(SessionRegistry::new(100));
        let metrics = Arc::new(ServerMetrics::new());

        let guard = registry.register(peer(1), metrics.clone()).unwrap();
        let id = guard.record().id();
        assert_eq!(registry.count(), 1);
        assert_eq!(guard.record().state(), SessionState::AwaitingHandshake);
        assert!(registry.get(id).is_some());

        let record = Arc::clone(guard.record());
        drop(guard);
        assert_eq!(registry.count(), 0);
        assert_eq!(record.state(), SessionState::Closed);
    }

    #[test]
    fn test_max_sessions_limit() {
        let registry = Arc::new(SessionRegistry::new(2));
        let metrics = Arc::new(ServerMetrics::new());

        let a = registry.register(peer(1), metrics.clone()).unwrap();
        let _b = registry.register(peer(2), metrics.clone()).unwrap();
        assert!(registry.register(peer(3), metrics.clone()).is_none());

        drop(a);
        assert!(registry.register(peer(4), metrics).is_some());
    }

    #[test]
    fn test_unique_ids() {
        let registry = Arc::new(SessionRegistry::new(10));
        let metrics = Arc::new(ServerMetrics::new());
        let a = registry.register(peer(1), metrics.clone()).unwrap();
        let b = registry.register(peer(1), metrics).unwrap();
        assert_ne!(a.record().id(), b.record().id());
    }

    #[test]
    fn test_session_stats_and_metrics() {
        let registry = Arc::new(SessionRegistry::new(10));
        let metrics = Arc::new(ServerMetrics::new());
        let guard = registry.register(peer(5555), metrics.clone()).unwrap();
        let record = guard.record();

        record.set_state(SessionState::Relaying);
        record.set_target(TargetAddr::parse("example.com:443").unwrap());
        record.record_opened(100);
        record.record_sealed(250);

        let stats = record.stats();
        assert_eq!(stats.state, SessionState::Relaying);
        assert_eq!(stats.target.as_deref(), Some("example.com:443"));
        assert_eq!(stats.bytes_upstream, 100);
        assert_eq!(stats.bytes_downstream, 250);
        assert_eq!(registry.all_stats().len(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_upstream, 100);
        assert_eq!(snapshot.bytes_downstream, 250);
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let registry = Arc::new(SessionRegistry::new(10));
        let metrics = Arc::new(ServerMetrics::new());
        assert!(registry.wait_empty(Duration::from_millis(10)).await);

        let guard = registry.register(peer(1), metrics).unwrap();
        assert!(!registry.wait_empty(Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(registry.wait_empty(Duration::from_secs(2)).await);
    }
}
