//! Configuration for the exchange gateway.
//!
//! Everything is read from a single JSON file. Every field has a production
//! default, so an empty object `{}` is a valid configuration that talks to
//! the public Binance spot endpoints.
//!
//! # Example config
//!
//! ```json
//! {
//!   "log": { "level": "debug", "dir": "/tmp/log", "module_name": "xg" },
//!   "rest": { "hosts": ["api.binance.com", "api1.binance.com"] },
//!   "stream": { "command_interval_ms": 200, "request_timeout_ms": 5000 },
//!   "channels": ["btcusdt@kline_1m", "ethusdt@kline_1m"]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::XgError;

/// Top-level application config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub log: LogConfig,
    pub rest: RestConfig,
    pub stream: StreamConfig,
    /// Channels the runner subscribes to on start.
    pub channels: Vec<String>,
}

impl GatewayConfig {
    /// Reject values that would make the clients unusable.
    pub fn validate(&self) -> Result<(), XgError> {
        self.rest.validate()?;
        self.stream.validate()
    }
}

/// Logging settings, consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level if `RUST_LOG` is not set.
    pub level: String,
    /// Optional directory for daily-rotating log files.
    pub dir: Option<String>,
    /// Log file prefix.
    pub module_name: String,
    /// Emit JSON lines on the console instead of human-readable text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            dir: None,
            module_name: "xg".into(),
            json: false,
        }
    }
}

/// REST client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Hosts in priority order; every request walks this list front to back.
    pub hosts: Vec<String>,
    /// URL scheme (`https` in production).
    pub scheme: String,
    /// Per-attempt HTTP timeout in milliseconds.
    pub timeout_ms: u64,
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), XgError> {
        if self.hosts.is_empty() {
            return Err(XgError::Config("rest.hosts must not be empty".into()));
        }
        if self.scheme != "https" && self.scheme != "http" {
            return Err(XgError::Config(format!(
                "rest.scheme must be http or https, got {:?}",
                self.scheme
            )));
        }
        Ok(())
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            hosts: default_rest_hosts(),
            scheme: "https".into(),
            timeout_ms: 10_000,
        }
    }
}

/// Combined-stream settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Combined stream WebSocket endpoint.
    pub endpoint: String,
    /// Upper bound for DNS + TCP + TLS + handshake.
    pub dial_timeout_ms: u64,
    /// Minimum spacing between two outbound method frames.
    pub command_interval_ms: u64,
    /// Capacity of the outbound method queue.
    pub queue_capacity: usize,
    /// How long a method call waits for its reply.
    pub request_timeout_ms: u64,
}

impl StreamConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_millis(self.command_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), XgError> {
        if self.endpoint.is_empty() {
            return Err(XgError::Config("stream.endpoint must not be empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(XgError::Config("stream.queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://stream.binance.com:9443/stream".into(),
            dial_timeout_ms: 5_000,
            command_interval_ms: 200, // 5 messages per second
            queue_capacity: 64,
            request_timeout_ms: 10_000,
        }
    }
}

fn default_rest_hosts() -> Vec<String> {
    ["api.binance.com", "api1.binance.com", "api2.binance.com", "api3.binance.com"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Parse a JSON config string.
pub fn parse_config(content: &str) -> anyhow::Result<GatewayConfig> {
    let config: GatewayConfig = serde_json::from_str(content).context("invalid config JSON")?;
    config.validate()?;
    Ok(config)
}

/// Load and parse a JSON config file.
pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let cfg = parse_config("{}").unwrap();
        assert_eq!(cfg.rest.hosts.len(), 4);
        assert_eq!(cfg.rest.hosts[0], "api.binance.com");
        assert_eq!(cfg.rest.scheme, "https");
        assert_eq!(cfg.stream.command_interval(), Duration::from_millis(200));
        assert_eq!(cfg.stream.dial_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.log.level, "info");
        assert!(cfg.channels.is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_config(
            r#"{
                "rest": { "hosts": ["127.0.0.1:8080"], "scheme": "http" },
                "stream": { "request_timeout_ms": 1500 },
                "channels": ["btcusdt@kline_1m"]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.rest.hosts, vec!["127.0.0.1:8080".to_string()]);
        assert_eq!(cfg.rest.timeout_ms, 10_000);
        assert_eq!(cfg.stream.request_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.stream.queue_capacity, 64);
        assert_eq!(cfg.channels, vec!["btcusdt@kline_1m".to_string()]);
    }

    #[test]
    fn rejects_empty_host_list() {
        let err = parse_config(r#"{ "rest": { "hosts": [] } }"#).unwrap_err();
        assert!(err.to_string().contains("rest.hosts"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_config(r#"{ "rest": { "scheme": "ftp" } }"#).is_err());
    }
}
