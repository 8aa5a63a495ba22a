//! # ws-engine
//!
//! A WebSocket protocol engine: the RFC 6455 opening handshake for servers
//! and clients, HYBI-10 framing, a connection registry and a single-threaded
//! readiness loop that reports connection and message events to application
//! handlers.
//!
//! ## Modules
//!
//! - [`websocket`]: protocol, connections and the engine loop
//! - [`config`]: TOML configuration and validation

pub mod config;
pub mod websocket;
