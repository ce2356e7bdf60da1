//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_reports_parse_and_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");

        std::fs::write(&path, "servers = 3").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));

        std::fs::write(&path, "[[servers]]\nname = \"a\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("addr must not be empty"));

        std::fs::write(&path, "[[servers]]\nname = \"a\"\naddr = \"127.0.0.1:0\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.servers[0].shutdown_timeout_ms, 30_000);
        assert!(config.servers[0].allow_http2);

        assert!(matches!(load_config(&dir.path().join("absent.toml")), Err(ConfigError::Io(_))));
    }
}
