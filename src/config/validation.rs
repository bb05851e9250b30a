//! Configuration validation.

use crate::config::Config;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - Non-zero read, write and drain timeouts
/// - A positive listen backlog
/// - Non-empty TLS certificate and key paths
/// - A metrics path starting with `/`
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();
    let server = &config.server;

    if server.read_timeout == Duration::ZERO {
        errors.push("server.read_timeout must be greater than zero".to_string());
    }

    if server.write_timeout == Duration::ZERO {
        errors.push("server.write_timeout must be greater than zero".to_string());
    }

    if server.drain_timeout == Some(Duration::ZERO) {
        errors.push("server.drain_timeout must be greater than zero when set".to_string());
    }

    if server.backlog <= 0 {
        errors.push(format!(
            "server.backlog must be at least 1, got {}",
            server.backlog
        ));
    }

    if let Some(ref tls) = server.tls {
        if tls.cert.as_os_str().is_empty() {
            errors.push("server.tls.cert cannot be empty".to_string());
        }
        if tls.key.as_os_str().is_empty() {
            errors.push("server.tls.key cannot be empty".to_string());
        }
    }

    let metrics = &config.global.metrics;
    if metrics.enabled && !metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics path '{}' must start with '/'",
            metrics.path
        ));
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::path::PathBuf;

    #[test]
    fn test_valid_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_timeouts() {
        let mut config = Config::default();
        config.server.read_timeout = Duration::ZERO;
        config.server.write_timeout = Duration::ZERO;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("read_timeout"));
        assert!(err.contains("write_timeout"));
    }

    #[test]
    fn test_zero_drain_timeout() {
        let mut config = Config::default();
        config.server.drain_timeout = Some(Duration::ZERO);
        assert!(validate_config(&config).unwrap_err().contains("drain_timeout"));
    }

    #[test]
    fn test_bad_backlog() {
        let mut config = Config::default();
        config.server.backlog = 0;
        assert!(validate_config(&config).unwrap_err().contains("backlog"));
    }

    #[test]
    fn test_empty_tls_paths() {
        let mut config = Config::default();
        config.server.tls = Some(TlsConfig {
            cert: PathBuf::new(),
            key: PathBuf::from("key.pem"),
        });
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("tls.cert"));
        assert!(!err.contains("tls.key"));
    }

    #[test]
    fn test_metrics_path() {
        let mut config = Config::default();
        config.global.metrics.path = "metrics".to_string();
        assert!(validate_config(&config).unwrap_err().contains("must start with '/'"));

        config.global.metrics.enabled = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.global.log_level = "loud".to_string();
        assert!(validate_config(&config).unwrap_err().contains("invalid log level"));
    }
}
