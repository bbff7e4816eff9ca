//! Server metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Connections given a slot
    accepted_connections: AtomicU64,
    /// Connections dropped because every slot was busy
    rejected_connections: AtomicU64,
    /// Sessions currently holding a slot
    active_sessions: AtomicU64,
    /// Sessions evicted after closing
    closed_sessions: AtomicU64,
    /// Requests refused for protocol reasons
    protocol_errors: AtomicU64,
    /// Failed resolutions and dials
    dial_failures: AtomicU64,
    /// Successful plain TCP dials
    plain_dials: AtomicU64,
    /// Successful TLS dials
    encrypted_dials: AtomicU64,
    /// Bytes relayed client → target
    bytes_to_remote: AtomicU64,
    /// Bytes relayed target → client
    bytes_to_local: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            accepted_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            closed_sessions: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            plain_dials: AtomicU64::new(0),
            encrypted_dials: AtomicU64::new(0),
            bytes_to_remote: AtomicU64::new(0),
            bytes_to_local: AtomicU64::new(0),
        }
    }

    /// Record a connection that got a slot.
    pub fn session_opened(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session leaving its slot.
    pub fn session_closed(&self) {
        self.closed_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn increment_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dial_failures(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful dial of either kind.
    pub fn record_dial(&self, encrypted: bool) {
        if encrypted {
            self.encrypted_dials.fetch_add(1, Ordering::Relaxed);
        } else {
            self.plain_dials.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Add relayed byte counts.
    pub fn add_relayed(&self, to_remote: usize, to_local: usize) {
        if to_remote > 0 {
            self.bytes_to_remote
                .fetch_add(to_remote as u64, Ordering::Relaxed);
        }
        if to_local > 0 {
            self.bytes_to_local.fetch_add(to_local as u64, Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get active sessions.
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions(),
            closed_sessions: self.closed_sessions.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            plain_dials: self.plain_dials.load(Ordering::Relaxed),
            encrypted_dials: self.encrypted_dials.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_local: self.bytes_to_local.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let s = self.snapshot();

        format!(
            r#"slotsocks Metrics
=================
Uptime: {} seconds

Sessions:
  Accepted: {}
  Rejected: {}
  Active:   {}
  Closed:   {}

Dials:
  Plain:     {}
  Encrypted: {}
  Failed:    {}

Traffic:
  To targets: {} bytes
  To clients: {} bytes

Protocol Errors: {}
"#,
            s.uptime_secs,
            s.accepted_connections,
            s.rejected_connections,
            s.active_sessions,
            s.closed_sessions,
            s.plain_dials,
            s.encrypted_dials,
            s.dial_failures,
            s.bytes_to_remote,
            s.bytes_to_local,
            s.protocol_errors,
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
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub active_sessions: u64,
    pub closed_sessions: u64,
    pub protocol_errors: u64,
    pub dial_failures: u64,
    pub plain_dials: u64,
    pub encrypted_dials: u64,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

impl MetricsSnapshot {
    /// Share of dials that went out over TLS.
    pub fn encrypted_ratio(&self) -> f64 {
        let total = self.plain_dials + self.encrypted_dials;
        if total == 0 {
            0.0
        } else {
            self.encrypted_dials as f64 / total as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_to_remote + self.bytes_to_local) as f64 / self.uptime_secs as f64
        }
    }
}
