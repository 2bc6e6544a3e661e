//! Server metrics collection.
//!
//! Aggregate counters only: no peer addresses or targets are kept here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{Error, ErrorKind};

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current active connections
    active_connections: AtomicU64,
    /// Connections closed because `max_sessions` was reached
    rejected_connections: AtomicU64,
    /// Sessions that reached the relaying state
    relayed_sessions: AtomicU64,
    /// Plaintext bytes delivered to targets
    bytes_upstream: AtomicU64,
    /// Plaintext bytes sent back to clients
    bytes_downstream: AtomicU64,
    /// Malformed or undecryptable handshakes
    handshake_errors: AtomicU64,
    /// Declared targets that could not be reached
    unreachable_targets: AtomicU64,
    /// Tokens that failed verification while relaying
    integrity_failures: AtomicU64,
    /// I/O errors and timeouts
    transport_errors: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            relayed_sessions: AtomicU64::new(0),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
            handshake_errors: AtomicU64::new(0),
            unreachable_targets: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment rejected connection count.
    pub fn increment_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment relayed session count.
    pub fn increment_relayed(&self) {
        self.relayed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to the client → target counter.
    pub fn add_bytes_upstream(&self, bytes: u64) {
        self.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to the target → client counter.
    pub fn add_bytes_downstream(&self, bytes: u64) {
        self.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count a session-ending error under its kind.
    pub fn record_error(&self, err: &Error) {
        let counter = match err.kind() {
            ErrorKind::Handshake | ErrorKind::Socks5 | ErrorKind::Config => &self.handshake_errors,
            ErrorKind::TargetUnreachable => &self.unreachable_targets,
            ErrorKind::Integrity => &self.integrity_failures,
            ErrorKind::Transport => &self.transport_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get rejected connections.
    pub fn rejected_connections(&self) -> u64 {
        self.rejected_connections.load(Ordering::Relaxed)
    }

    /// Get handshake errors.
    pub fn handshake_errors(&self) -> u64 {
        self.handshake_errors.load(Ordering::Relaxed)
    }

    /// Get integrity failures.
    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            rejected_connections: self.rejected_connections(),
            relayed_sessions: self.relayed_sessions.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            handshake_errors: self.handshake_errors(),
            unreachable_targets: self.unreachable_targets.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures(),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Relay Server Metrics
====================
Uptime: {} seconds

Connections:
  Total:    {}
  Active:   {}
  Rejected: {}
  Relayed:  {}

Traffic:
  To targets: {} bytes
  To clients: {} bytes

Errors:
  Handshake:          {}
  Unreachable Target: {}
  Integrity:          {}
  Transport:          {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.rejected_connections,
            snapshot.relayed_sessions,
            snapshot.bytes_upstream,
            snapshot.bytes_downstream,
            snapshot.handshake_errors,
            snapshot.unreachable_targets,
            snapshot.integrity_failures,
            snapshot.transport_errors,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub relayed_sessions: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    pub handshake_errors: u64,
    pub unreachable_targets: u64,
    pub integrity_failures: u64,
    pub transport_errors: u64,
}

impl MetricsSnapshot {
    /// Share of accepted connections that ended in a handshake error.
    pub fn handshake_failure_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.handshake_errors as f64 / self.total_connections as f64
        }
    }

    /// Calculate connections per second.
    pub fn connections_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.total_connections as f64 / self.uptime_secs as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_upstream + self.bytes_downstream) as f64 / self.uptime_secs as f64
        }
    }
}
