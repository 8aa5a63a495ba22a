//! # WebSocket Engine
//!
//! RFC 6455 handshake, HYBI-10 framing and a single-threaded readiness loop
//! servicing many connections, with named events for application code.
//!
//! ## Features
//!
//! - Server and client opening handshake
//! - Text, ping, pong and close frames
//! - Connection registry with path lookup
//! - Persistent and one-shot event handlers
//! - Origin allow-list and connection limit
//!
//! ## Example
//!
//! ```no_run
//! use ws_engine::config::EngineConfig;
//! use ws_engine::websocket::{Engine, Event};
//!
//! let mut engine = Engine::server(EngineConfig::new("127.0.0.1", 8080))?;
//! engine.on("receive", |hub, event| {
//!     if let Event::Receive { peer, payload } = event {
//!         hub.broadcast(&peer.path, payload);
//!     }
//!     Ok(())
//! })?;
//! engine.run()?;
//! # Ok::<(), ws_engine::websocket::WebSocketError>(())
//! ```

mod connection;
mod engine;
mod error;
mod events;
pub mod frame;
mod registry;
mod stats;
pub mod upgrade;

pub use connection::{Connection, ConnectionId, Peer};
pub use engine::{Engine, EngineState, Hub, Role, StopHandle};
pub use error::{HandlerError, WebSocketError, WebSocketResult};
pub use events::{Event, EventKind, HandlerResult, TransportErrorInfo};
pub use frame::{CloseCode, Frame, FrameDecoder, OpCode};
pub use stats::EngineStats;
