//! Server configuration.
//!
//! Layered with figment: compiled defaults, then an optional JSON file, then
//! `PROTOO_*` environment variables (e.g. `PROTOO_PORT=4443`).

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PROTOO_";

/// Configuration for the protoo server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// HTTP path WebSocket upgrades are accepted on.
    pub path: String,
    /// Sub-protocol clients must offer.
    pub subprotocol: String,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between WebSocket pings; `0` disables them.
    pub heartbeat_interval_secs: u64,
    /// Outbound messages buffered per connection.
    pub send_queue_capacity: usize,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/".into(),
            subprotocol: "protoo".into(),
            max_message_size: 16 * 1024 * 1024, // 16 MB
            heartbeat_interval_secs: 30,
            send_queue_capacity: 256,
            log_level: "info".into(),
            log_json: false,
        }
    }
}

impl ServerConfig {
    /// Load defaults, the optional JSON file at `path`, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            figment = figment.merge(Json::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| ConfigError::Invalid(Box::new(e)))
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ping interval, `None` when disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}
