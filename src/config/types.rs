//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address and port to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Bound on reading request headers and on the TLS handshake
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Bound on producing one response
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Keep idle connections open between requests
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Serve HTTP/2 next to HTTP/1.1
    #[serde(default)]
    pub http2: bool,

    /// Install OS signal handlers
    #[serde(default = "default_true")]
    pub handle_signals: bool,

    /// Give up draining after this long and stop anyway
    #[serde(default, with = "option_humantime_serde")]
    pub drain_timeout: Option<Duration>,

    /// Pending-connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// TLS settings; plain HTTP when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            keep_alive: true,
            http2: false,
            handle_signals: true,
            drain_timeout: None,
            backlog: default_backlog(),
            tls: None,
        }
    }
}

/// TLS key pair locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert: PathBuf,

    /// PEM private key
    pub key: PathBuf,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_backlog() -> i32 {
    crate::server::DEFAULT_BACKLOG
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom serde module for optional humantime durations.
mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let d = humantime::parse_duration(&s).map_err(serde::de::Error::custom)?;
                Ok(Some(d))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.server.read_timeout, Duration::from_secs(5));
        assert_eq!(config.server.write_timeout, Duration::from_secs(10));
        assert!(config.server.drain_timeout.is_none());
        assert!(config.server.tls.is_none());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.server.keep_alive);
        assert!(config.server.handle_signals);
        assert_eq!(config.global.metrics.path, "/metrics");
    }

    #[test]
    fn test_server_durations() {
        let yaml = r#"
listen: "127.0.0.1:9000"
read_timeout: 2s
write_timeout: 1m
drain_timeout: 500ms
tls:
  cert: /etc/tls/cert.pem
  key: /etc/tls/key.pem
"#;
        let server: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(server.read_timeout, Duration::from_secs(2));
        assert_eq!(server.write_timeout, Duration::from_secs(60));
        assert_eq!(server.drain_timeout, Some(Duration::from_millis(500)));
        assert_eq!(server.tls.unwrap().cert, PathBuf::from("/etc/tls/cert.pem"));
    }

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_yaml::from_str("pretty").unwrap();
        assert_eq!(format, LogFormat::Pretty);
    }
}
