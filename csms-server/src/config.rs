//! Configuration for the central system
//!
//! Built with `Default` plus `with_*` methods, or loaded from a JSON file.
//! Durations are given in milliseconds in the file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use csms_core::central::DEFAULT_HEARTBEAT_INTERVAL;
use csms_core::{FallbackPolicy, FallbackRule};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Complete server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Device-facing WebSocket listener
    pub ws_bind: SocketAddr,

    /// Operator-facing HTTP control API
    pub http_bind: SocketAddr,

    /// Path prefix in front of the charge point identity
    pub ws_path_prefix: String,

    /// How long a command waits for the charge point
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,

    /// Interval between server pings on idle connections
    #[serde(rename = "ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,

    /// Largest WebSocket message accepted (bytes)
    pub max_message_size: usize,

    /// Largest WebSocket frame accepted (bytes)
    pub max_frame_size: usize,

    /// Heartbeat interval handed out in BootNotification responses (seconds)
    pub heartbeat_interval: i32,

    pub fallback: FallbackConfig,
}

/// Timeout fallback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,

    /// Rules added to, or replacing, the built-in ones
    pub actions: HashMap<String, FallbackRule>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            ws_path_prefix: "/ws/ocpp/".to_string(),
            call_timeout: Duration::from_millis(5000),
            ping_interval: Duration::from_millis(30_000),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            fallback: FallbackConfig::default(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            actions: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ServerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set the WebSocket listen address
    pub fn with_ws_bind(mut self, addr: SocketAddr) -> Self {
        self.ws_bind = addr;
        self
    }

    /// Set the HTTP listen address
    pub fn with_http_bind(mut self, addr: SocketAddr) -> Self {
        self.http_bind = addr;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Add or replace the fallback rule for one action
    pub fn with_fallback_rule(mut self, action: impl Into<String>, rule: FallbackRule) -> Self {
        self.fallback.actions.insert(action.into(), rule);
        self
    }

    /// Surface every timeout as `CallTimeout`
    pub fn without_fallback(mut self) -> Self {
        self.fallback.enabled = false;
        self
    }

    /// Built-in fallback rules with this config's overrides applied
    pub fn fallback_policy(&self) -> FallbackPolicy {
        let mut policy = FallbackPolicy::ocpp16_defaults();
        for (action, rule) in &self.fallback.actions {
            policy.set_rule(action.clone(), rule.clone());
        }
        policy.set_enabled(self.fallback.enabled);
        policy
    }

    /// Path prefix with exactly one leading and one trailing slash
    pub fn normalized_path_prefix(&self) -> String {
        let trimmed = self.ws_path_prefix.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", trimmed)
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
