//! Observability and Metrics
//!
//! Per-node counters for connections, gossip and forwarding, backed by relaxed
//! atomics so every connection task can record without coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one mesh node
#[derive(Debug)]
pub struct Metrics {
    /// Total connections that reached Established
    pub connections_total: AtomicU64,
    /// Currently established connections
    pub connections_active: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Failed handshakes (rejected, timed out or violated)
    pub handshakes_failed: AtomicU64,
    /// Messages written to peers
    pub messages_sent: AtomicU64,
    /// Messages decoded from peers
    pub messages_received: AtomicU64,
    /// NodeSummary messages sent
    pub gossip_summaries: AtomicU64,
    /// NodeRequest messages sent
    pub gossip_requests: AtomicU64,
    /// Routing entries replaced by a newer version
    pub routing_updates: AtomicU64,
    /// Payloads handed to the local application
    pub data_delivered: AtomicU64,
    /// Data messages relayed to a next hop
    pub data_forwarded: AtomicU64,
    /// Deliveries that completed with DataAck at this node
    pub data_acked: AtomicU64,
    /// Deliveries that completed with DataReject at this node
    pub data_rejected: AtomicU64,
    /// Data messages that arrived with this node already in their path
    pub loops_detected: AtomicU64,
    /// Pending deliveries whose deadline expired
    pub delivery_timeouts: AtomicU64,
    /// Connections closed by a transport or liveness failure
    pub connection_errors: AtomicU64,
    /// Connections closed by a codec error or protocol violation
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            gossip_summaries: AtomicU64::new(0),
            gossip_requests: AtomicU64::new(0),
            routing_updates: AtomicU64::new(0),
            data_delivered: AtomicU64::new(0),
            data_forwarded: AtomicU64::new(0),
            data_acked: AtomicU64::new(0),
            data_rejected: AtomicU64::new(0),
            loops_detected: AtomicU64::new(0),
            delivery_timeouts: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gossip_summary(&self) {
        self.gossip_summaries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gossip_request(&self) {
        self.gossip_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routing_updated(&self, count: u64) {
        self.routing_updates.fetch_add(count, Ordering::Relaxed);
    }

    pub fn data_delivered(&self) {
        self.data_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn data_forwarded(&self) {
        self.data_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn data_acked(&self) {
        self.data_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn data_rejected(&self) {
        self.data_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn loop_detected(&self) {
        self.loops_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_timeout(&self) {
        self.delivery_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            gossip_summaries: self.gossip_summaries.load(Ordering::Relaxed),
            gossip_requests: self.gossip_requests.load(Ordering::Relaxed),
            routing_updates: self.routing_updates.load(Ordering::Relaxed),
            data_delivered: self.data_delivered.load(Ordering::Relaxed),
            data_forwarded: self.data_forwarded.load(Ordering::Relaxed),
            data_acked: self.data_acked.load(Ordering::Relaxed),
            data_rejected: self.data_rejected.load(Ordering::Relaxed),
            loops_detected: self.loops_detected.load(Ordering::Relaxed),
            delivery_timeouts: self.delivery_timeouts.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            handshakes_total = s.handshakes_total,
            handshakes_failed = s.handshakes_failed,
            messages_sent = s.messages_sent,
            messages_received = s.messages_received,
            gossip_summaries = s.gossip_summaries,
            gossip_requests = s.gossip_requests,
            routing_updates = s.routing_updates,
            data_delivered = s.data_delivered,
            data_forwarded = s.data_forwarded,
            data_acked = s.data_acked,
            data_rejected = s.data_rejected,
            loops_detected = s.loops_detected,
            delivery_timeouts = s.delivery_timeouts,
            connection_errors = s.connection_errors,
            protocol_errors = s.protocol_errors,
            uptime_seconds = s.uptime_seconds,
            "Mesh metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub gossip_summaries: u64,
    pub gossip_requests: u64,
    pub routing_updates: u64,
    pub data_delivered: u64,
    pub data_forwarded: u64,
    pub data_acked: u64,
    pub data_rejected: u64,
    pub loops_detected: u64,
    pub delivery_timeouts: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Logs how long an operation took when dropped.
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
