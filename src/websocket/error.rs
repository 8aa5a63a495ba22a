//! WebSocket error types.

use crate::config::ConfigError;
use crate::websocket::connection::ConnectionId;
use crate::websocket::frame::CloseCode;
use std::io;
use thiserror::Error;

/// Result type for WebSocket operations.
pub type WebSocketResult<T> = Result<T, WebSocketError>;

/// Boxed error returned by application event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while running the engine.
#[derive(Debug, Error)]
pub enum WebSocketError {
    /// A socket call failed.
    #[error("transport error during {op}: {source}")]
    Transport {
        /// The operation that failed (accept, read, write, ...).
        op: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The opening handshake could not be completed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The `Origin` header is missing or not in the allow-list.
    #[error("origin not allowed: {}", .0.as_deref().unwrap_or("<none>"))]
    OriginNotAllowed(Option<String>),

    /// A frame carried an opcode this engine does not handle.
    #[error("unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    /// The buffer ended before the declared frame did.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required for the full frame.
        needed: usize,
        /// Bytes present in the buffer.
        available: usize,
    },

    /// Frame payload exceeds what can be encoded or accepted.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Payload size.
        size: u64,
        /// Maximum allowed size.
        max: u64,
    },

    /// A text frame did not contain valid UTF-8.
    #[error("invalid UTF-8 in text frame")]
    InvalidUtf8,

    /// The live connection count reached `max_clients`.
    #[error("max clients limit reached ({max})")]
    CapacityExceeded {
        /// Configured limit.
        max: usize,
    },

    /// Subscription with an empty or unknown event name.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    /// No live connection with this id.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// An operation that needs a listening socket ran on a client engine, or
    /// the reverse.
    #[error("operation not available: {0}")]
    WrongRole(&'static str),

    /// The engine was stopped and cannot open sockets again.
    #[error("engine stopped: cannot {0}")]
    Stopped(&'static str),

    /// An application handler returned an error.
    #[error("event handler failed: {0}")]
    Handler(#[source] HandlerError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WebSocketError {
    /// Build a transport error for the given operation.
    pub fn transport(op: &'static str, source: io::Error) -> Self {
        Self::Transport { op, source }
    }

    /// The status code a connection is closed with when this error hits it.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::UnsupportedOpcode(_) => CloseCode::Unsupported,
            Self::FrameTooLarge { .. } => CloseCode::FrameTooLarge,
            Self::InvalidUtf8 => CloseCode::InvalidData,
            _ => CloseCode::Protocol,
        }
    }
}
