//! Per-engine counters.

use std::time::{Duration, Instant};

/// Statistics for one engine.
///
/// The engine is single-threaded, so counters are plain integers updated in
/// place; [`Engine::stats`](crate::websocket::Engine::stats) hands out a copy.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Total connections accepted or opened.
    connections_total: u64,
    /// Currently live connections.
    connections_active: u64,
    /// Connections refused because the engine was full.
    connections_rejected: u64,
    /// Successful handshakes.
    upgrades_success: u64,
    /// Failed handshakes, origin rejections included.
    upgrades_failed: u64,
    /// Text messages received.
    messages_received: u64,
    /// Text messages sent.
    messages_sent: u64,
    /// Bytes read from sockets.
    bytes_received: u64,
    /// Bytes written to sockets.
    bytes_sent: u64,
    /// Pings received.
    pings_received: u64,
    /// Pongs received.
    pongs_received: u64,
    /// Close frames written.
    closes_sent: u64,
    /// Protocol errors.
    errors_protocol: u64,
    /// Failed socket calls.
    errors_transport: u64,
    /// Failed event handlers.
    errors_handler: u64,
    /// Time the engine started serving.
    started_at: Option<Instant>,
}

impl EngineStats {
    pub(crate) fn started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub(crate) fn connection_opened(&mut self) {
        self.connections_total += 1;
        self.connections_active += 1;
    }

    pub(crate) fn connection_closed(&mut self) {
        self.connections_active = self.connections_active.saturating_sub(1);
    }

    pub(crate) fn connection_rejected(&mut self) {
        self.connections_rejected += 1;
    }

    pub(crate) fn upgrade_success(&mut self) {
        self.upgrades_success += 1;
    }

    pub(crate) fn upgrade_failed(&mut self) {
        self.upgrades_failed += 1;
    }

    pub(crate) fn message_received(&mut self) {
        self.messages_received += 1;
    }

    pub(crate) fn message_sent(&mut self) {
        self.messages_sent += 1;
    }

    pub(crate) fn bytes_in(&mut self, n: usize) {
        self.bytes_received += n as u64;
    }

    pub(crate) fn bytes_out(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    pub(crate) fn ping_received(&mut self) {
        self.pings_received += 1;
    }

    pub(crate) fn pong_received(&mut self) {
        self.pongs_received += 1;
    }

    pub(crate) fn close_sent(&mut self) {
        self.closes_sent += 1;
    }

    pub(crate) fn protocol_error(&mut self) {
        self.errors_protocol += 1;
    }

    pub(crate) fn transport_error(&mut self) {
        self.errors_transport += 1;
    }

    pub(crate) fn handler_error(&mut self) {
        self.errors_handler += 1;
    }

    /// Total connections accepted or opened.
    pub fn connections_total(&self) -> u64 {
        self.connections_total
    }

    /// Currently live connections.
    pub fn connections_active(&self) -> u64 {
        self.connections_active
    }

    /// Connections refused at accept.
    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected
    }

    /// Successful handshakes.
    pub fn upgrades_success(&self) -> u64 {
        self.upgrades_success
    }

    /// Failed handshakes.
    pub fn upgrades_failed(&self) -> u64 {
        self.upgrades_failed
    }

    /// Text messages received.
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Text messages sent.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Bytes read.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Bytes written.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Pings received.
    pub fn pings_received(&self) -> u64 {
        self.pings_received
    }

    /// Pongs received.
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received
    }

    /// Close frames written.
    pub fn closes_sent(&self) -> u64 {
        self.closes_sent
    }

    /// Protocol errors.
    pub fn errors_protocol(&self) -> u64 {
        self.errors_protocol
    }

    /// Failed socket calls.
    pub fn errors_transport(&self) -> u64 {
        self.errors_transport
    }

    /// Failed event handlers.
    pub fn errors_handler(&self) -> u64 {
        self.errors_handler
    }

    /// Time since the engine started, if it has.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}
