//! # Configuration System
//!
//! TOML-based configuration for the WebSocket engine, with validation.
//!
//! ## Example Configuration
//!
//! ```toml
//! address = "0.0.0.0"
//! port = 8080
//! max_clients = 1000
//! buffer_size = 2048
//! allowed_origins = ["example.com"]
//! enable_logging = true
//! poll_timeout = "10ms"
//! handshake_timeout = "5s"
//! ```
//!
//! Every key is optional; missing keys take their defaults.

mod error;
mod loader;
mod types;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use types::EngineConfig;
pub use validation::{
    BasicValidator, OriginValidator, ValidationError, ValidationResult, ValidationSeverity,
    Validator,
};
