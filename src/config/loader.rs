//! Configuration file loader.

use super::error::{ConfigError, ConfigResult};
use super::types::EngineConfig;
use super::validation::Validator;
use std::path::Path;

/// Configuration loader with validation support.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Validators to run on loaded configuration.
    validators: Vec<Box<dyn Validator>>,
}

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validator to the loader.
    #[must_use]
    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist
    /// - The file cannot be read
    /// - The TOML is malformed
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<EngineConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.load_str(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn load_str(&self, content: &str) -> ConfigResult<EngineConfig> {
        let config: EngineConfig = toml::from_str(content)?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Run every registered validator against `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing the failures of the
    /// first validator that rejects the configuration.
    pub fn validate(&self, config: &EngineConfig) -> ConfigResult<()> {
        for validator in &self.validators {
            let result = validator.validate(config);
            for warning in result.warnings() {
                tracing::warn!(field = %warning.field, "{}", warning.message);
            }
            if !result.is_valid() {
                let errors: Vec<String> = result
                    .errors_only()
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect();
                return Err(ConfigError::ValidationError(errors.join("; ")));
            }
        }
        Ok(())
    }

    /// Load configuration or return default if file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(&self, path: P) -> ConfigResult<EngineConfig> {
        let path = path.as_ref();
        if path.exists() {
            self.load(path)
        } else {
            Ok(EngineConfig::default())
        }
    }

    /// Save configuration to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save<P: AsRef<Path>>(&self, config: &EngineConfig, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(config)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BasicValidator;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_load_from_string() {
        let loader = ConfigLoader::new();
        let config = loader
            .load_str(
                r#"
            address = "127.0.0.1"
            port = 9000
        "#,
            )
            .unwrap();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("engine.toml");

        std::fs::write(
            &config_path,
            r#"
            max_clients = 5
            allowed_origins = ["example.com", "localhost"]
        "#,
        )
        .unwrap();

        let loader = ConfigLoader::new();
        let config = loader.load(&config_path).unwrap();
        assert_eq!(config.max_clients, 5);
        assert_eq!(config.allowed_origins.len(), 2);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let loader = ConfigLoader::new();
        let result = loader.load("/nonexistent/path/engine.toml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_malformed() {
        let loader = ConfigLoader::new();
        let result = loader.load_str("port = \"eighty\"");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_or_default() {
        let loader = ConfigLoader::new();
        let config = loader.load_or_default("/nonexistent/path").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_validator_rejects() {
        let loader = ConfigLoader::new().with_validator(BasicValidator::new());
        let result = loader.load_str("max_clients = 0");
        match result {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("max_clients")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("saved.toml");

        let mut config = EngineConfig::new("127.0.0.1", 9100);
        config.poll_timeout = Duration::from_millis(50);

        let loader = ConfigLoader::new();
        loader.save(&config, &config_path).unwrap();

        let loaded = loader.load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }
}
