//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.retries.max_attempts, 2);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.supervisor.coalesce_ms, 100);
        assert_eq!(config.router.not_found_status, 404);
    }

    #[test]
    fn test_full_topology() {
        let text = r#"
            [observability]
            log_level = "debug"
            log_format = "json"

            [[upstreams]]
            id = "up1"
            [[upstreams.endpoints]]
            id = "e1"
            url = "http://127.0.0.1:5000"

            [[hosts]]
            name = "localhost"
            [[hosts.listeners]]
            id = "l1"
            protocol = "http"
            address = { address = "127.0.0.1:8080" }
            [[hosts.locations]]
            id = "loc1"
            path = "/"
            upstream = "up1"
            [[hosts.locations.middlewares]]
            id = "rl"
            type = "ratelimit"
            priority = 1
            config = { requests = 10, variable = "client.ip" }
        "#;
        let config = parse_config(text).unwrap();
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.upstreams[0].endpoints[0].url, "http://127.0.0.1:5000");
        let host = &config.hosts[0];
        assert_eq!(host.listeners[0].address.network, "tcp");
        assert_eq!(host.locations[0].middlewares[0].type_name, "ratelimit");
    }

    #[test]
    fn test_validation_error_surfaces() {
        let err = parse_config("[retries]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert!(err.to_string().contains("retries.max_attempts"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[health]\nfailure_threshold = 5").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.health.failure_threshold, 5);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
