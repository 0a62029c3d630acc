// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine-wide counters.
//!
//! Every connection state transition relevant to measurement reports here.
//! Counters are plain relaxed atomics; per-connection failures may be
//! rate-limited in the logs but are always reflected in these aggregates.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::codec::{PacketType, NUM_PACKET_TYPES};

// ============================================================================
// EngineMetrics
// ============================================================================

/// Aggregate counters for one engine instance.
#[derive(Debug)]
pub struct EngineMetrics {
    // Connection lifecycle
    conns_attempted: AtomicU64,
    tcp_connects: AtomicU64,
    tls_connects: AtomicU64,
    ws_connects: AtomicU64,
    mqtt_connects: AtomicU64,
    conn_failures: AtomicU64,
    socket_errors: AtomicU64,
    disconnects: AtomicU64,
    reconnects_scheduled: AtomicU64,
    stuck_rescheduled: AtomicU64,
    active_connections: AtomicUsize,

    // Traffic
    tx_packets: [AtomicU64; NUM_PACKET_TYPES],
    rx_packets: [AtomicU64; NUM_PACKET_TYPES],
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    // Backpressure and faults
    would_block_writes: AtomicU64,
    pool_exhausted: AtomicU64,
    malformed_packets: AtomicU64,
    internal_errors: AtomicU64,

    // Connect latency aggregates (nanoseconds)
    tcp_connect_ns: AtomicU64,
    mqtt_connect_ns: AtomicU64,

    start_time: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            conns_attempted: AtomicU64::new(0),
            tcp_connects: AtomicU64::new(0),
            tls_connects: AtomicU64::new(0),
            ws_connects: AtomicU64::new(0),
            mqtt_connects: AtomicU64::new(0),
            conn_failures: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            stuck_rescheduled: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
            tx_packets: std::array::from_fn(|_| AtomicU64::new(0)),
            rx_packets: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            would_block_writes: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
            tcp_connect_ns: AtomicU64::new(0),
            mqtt_connect_ns: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    pub fn record_conn_attempt(&self) {
        self.conns_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_connect(&self, elapsed: Duration) {
        self.tcp_connects.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.tcp_connect_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_tls_connect(&self) {
        self.tls_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ws_connect(&self) {
        self.ws_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mqtt_connect(&self, elapsed: Duration) {
        self.mqtt_connects.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connect_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_conn_failure(&self) {
        self.conn_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the socket-error counter, returning the previous value so
    /// callers can rate-limit their logging on it.
    pub fn record_socket_error(&self) -> u64 {
        self.socket_errors.fetch_add(1, Ordering::Relaxed)
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        // A connection that failed before establishment never incremented
        // the active gauge.
        let _ = self.active_connections.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |v| v.checked_sub(1),
        );
    }

    pub fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stuck_rescheduled(&self) {
        self.stuck_rescheduled.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Traffic
    // ========================================================================

    pub fn record_tx_packet(&self, ptype: PacketType) {
        self.tx_packets[ptype.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx_packet(&self, ptype: PacketType) {
        self.rx_packets[ptype.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    // ========================================================================
    // Backpressure and faults
    // ========================================================================

    pub fn record_would_block_write(&self) {
        self.would_block_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_packet(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Getters / snapshot
    // ========================================================================

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn mqtt_connects(&self) -> u64 {
        self.mqtt_connects.load(Ordering::Relaxed)
    }

    pub fn tx_packets(&self, ptype: PacketType) -> u64 {
        self.tx_packets[ptype.index()].load(Ordering::Relaxed)
    }

    pub fn rx_packets(&self, ptype: PacketType) -> u64 {
        self.rx_packets[ptype.index()].load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tx: Vec<u64> = self
            .tx_packets
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let rx: Vec<u64> = self
            .rx_packets
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        MetricsSnapshot {
            conns_attempted: self.conns_attempted.load(Ordering::Relaxed),
            tcp_connects: self.tcp_connects.load(Ordering::Relaxed),
            tls_connects: self.tls_connects.load(Ordering::Relaxed),
            ws_connects: self.ws_connects.load(Ordering::Relaxed),
            mqtt_connects: self.mqtt_connects.load(Ordering::Relaxed),
            conn_failures: self.conn_failures.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            stuck_rescheduled: self.stuck_rescheduled.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            tx_packets_total: tx.iter().sum(),
            rx_packets_total: rx.iter().sum(),
            tx_packets: tx,
            rx_packets: rx,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            would_block_writes: self.would_block_writes.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            tcp_connect_ns: self.tcp_connect_ns.load(Ordering::Relaxed),
            mqtt_connect_ns: self.mqtt_connect_ns.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MetricsSnapshot
// ============================================================================

/// Point-in-time copy of the engine counters.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub conns_attempted: u64,
    pub tcp_connects: u64,
    pub tls_connects: u64,
    pub ws_connects: u64,
    pub mqtt_connects: u64,
    pub conn_failures: u64,
    pub socket_errors: u64,
    pub disconnects: u64,
    pub reconnects_scheduled: u64,
    pub stuck_rescheduled: u64,
    pub active_connections: usize,
    pub tx_packets: Vec<u64>,
    pub rx_packets: Vec<u64>,
    pub tx_packets_total: u64,
    pub rx_packets_total: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub would_block_writes: u64,
    pub pool_exhausted: u64,
    pub malformed_packets: u64,
    pub internal_errors: u64,
    pub tcp_connect_ns: u64,
    pub mqtt_connect_ns: u64,
    pub uptime_secs: f64,
}

impl MetricsSnapshot {
    /// Packets per second over the engine lifetime.
    pub fn packet_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            (self.tx_packets_total + self.rx_packets_total) as f64 / self.uptime_secs
        } else {
            0.0
        }
    }

    /// Mean TCP connect latency, when any connect completed.
    pub fn avg_tcp_connect(&self) -> Option<Duration> {
        if self.tcp_connects > 0 {
            Some(Duration::from_nanos(self.tcp_connect_ns / self.tcp_connects))
        } else {
            None
        }
    }

    /// Fraction of connection attempts that reached the TCP established
    /// state.
    pub fn connect_success_rate(&self) -> f64 {
        if self.conns_attempted > 0 {
            self.tcp_connects as f64 / self.conns_attempted as f64
        } else {
            1.0
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counters() {
        let m = EngineMetrics::new();
        m.record_conn_attempt();
        m.record_tcp_connect(Duration::from_millis(2));
        assert_eq!(m.active_connections(), 1);

        m.record_mqtt_connect(Duration::from_millis(5));
        assert_eq!(m.mqtt_connects(), 1);

        m.record_disconnect();
        assert_eq!(m.active_connections(), 0);

        // A second disconnect must not underflow the gauge.
        m.record_disconnect();
        assert_eq!(m.active_connections(), 0);
    }

    #[test]
    fn test_per_type_packet_counters() {
        let m = EngineMetrics::new();
        m.record_tx_packet(PacketType::Publish);
        m.record_tx_packet(PacketType::Publish);
        m.record_rx_packet(PacketType::PubAck);

        assert_eq!(m.tx_packets(PacketType::Publish), 2);
        assert_eq!(m.rx_packets(PacketType::PubAck), 1);
        assert_eq!(m.tx_packets(PacketType::Connect), 0);
    }

    #[test]
    fn test_socket_error_returns_previous() {
        let m = EngineMetrics::new();
        assert_eq!(m.record_socket_error(), 0);
        assert_eq!(m.record_socket_error(), 1);
    }

    #[test]
    fn test_snapshot() {
        let m = EngineMetrics::new();
        m.record_conn_attempt();
        m.record_tcp_connect(Duration::from_micros(500));
        m.record_tx_packet(PacketType::Connect);
        m.record_bytes_sent(100);
        m.record_pool_exhausted();

        let snap = m.snapshot();
        assert_eq!(snap.conns_attempted, 1);
        assert_eq!(snap.tcp_connects, 1);
        assert_eq!(snap.tx_packets_total, 1);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.pool_exhausted, 1);
        assert_eq!(snap.avg_tcp_connect(), Some(Duration::from_micros(500)));
        assert!((snap.connect_success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rates_with_zero_uptime_guard() {
        let snap = MetricsSnapshot::default();
        assert_eq!(snap.packet_rate(), 0.0);
        assert_eq!(snap.avg_tcp_connect(), None);
        assert_eq!(snap.connect_success_rate(), 1.0);
    }
}
