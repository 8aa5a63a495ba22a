//! Configuration validation system.

use super::types::EngineConfig;

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// Error message.
    pub message: String,
    /// Severity level.
    pub severity: ValidationSeverity,
}

impl ValidationError {
    /// Create a new error.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Create a new warning.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Error - configuration is invalid.
    Error,
    /// Warning - configuration may have issues.
    Warning,
}

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty (valid) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error to the result.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Check if the validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .iter()
            .any(|e| e.severity == ValidationSeverity::Error)
    }

    /// Get all validation errors.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Get only errors (not warnings).
    #[must_use]
    pub fn errors_only(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Error)
            .collect()
    }

    /// Get only warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Warning)
            .collect()
    }

}

/// Trait for configuration validators.
pub trait Validator: std::fmt::Debug + Send + Sync {
    /// Validate a configuration and return any errors.
    fn validate(&self, config: &EngineConfig) -> ValidationResult;
}

/// Smallest handshake head the engine can reasonably accept.
const MIN_HANDSHAKE_SIZE: usize = 256;

/// Checks limits and the listen address.
#[derive(Debug, Default)]
pub struct BasicValidator;

impl BasicValidator {
    /// Create a new basic validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for BasicValidator {
    fn validate(&self, config: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.address.trim().is_empty() {
            result.add_error(ValidationError::error("address", "Address cannot be empty"));
        } else if let Err(e) = config.socket_addr() {
            result.add_error(ValidationError::error("address", e.to_string()));
        }

        if config.max_clients == 0 {
            result.add_error(ValidationError::error(
                "max_clients",
                "max_clients must be at least 1",
            ));
        }

        if config.buffer_size == 0 {
            result.add_error(ValidationError::error(
                "buffer_size",
                "buffer_size must be at least 1",
            ));
        }

        if config.max_handshake_size < MIN_HANDSHAKE_SIZE {
            result.add_error(ValidationError::error(
                "max_handshake_size",
                format!("max_handshake_size must be at least {MIN_HANDSHAKE_SIZE}"),
            ));
        }

        if config.max_frame_size == 0 {
            result.add_error(ValidationError::error(
                "max_frame_size",
                "max_frame_size must be at least 1",
            ));
        }

        if config.handshake_timeout.is_zero() {
            result.add_error(ValidationError::error(
                "handshake_timeout",
                "handshake_timeout must be greater than zero",
            ));
        }

        if config.poll_timeout.is_zero() {
            result.add_error(ValidationError::warning(
                "poll_timeout",
                "A zero poll timeout makes the engine spin",
            ));
        }

        if config.user_agent.is_empty() {
            result.add_error(ValidationError::warning(
                "user_agent",
                "Client handshakes will send an empty User-Agent",
            ));
        }

        result
    }
}

/// Checks the origin allow-list.
///
/// Entries are compared against the host of the `Origin` header, so a
/// scheme or port in an entry can never match.
#[derive(Debug, Default)]
pub struct OriginValidator;

impl OriginValidator {
    /// Create a new origin validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for OriginValidator {
    fn validate(&self, config: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut seen = std::collections::HashSet::new();

        for origin in &config.allowed_origins {
            let field = format!("allowed_origins.{origin}");
            if origin.trim().is_empty() {
                result.add_error(ValidationError::error(
                    "allowed_origins[]",
                    "Origin entry cannot be empty",
                ));
            } else if origin.contains("://") || origin.contains('/') {
                result.add_error(ValidationError::error(
                    field,
                    format!("'{origin}' must be a bare host name"),
                ));
            } else if origin.contains(':') && !origin.starts_with('[') {
                result.add_error(ValidationError::warning(
                    field,
                    format!("'{origin}' carries a port and will never match"),
                ));
            } else if !seen.insert(origin.to_ascii_lowercase()) {
                result.add_error(ValidationError::warning(
                    field,
                    format!("Duplicate origin: {origin}"),
                ));
            }
        }

        result
    }
}
