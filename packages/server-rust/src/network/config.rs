//! Network configuration types for the `Switchyard` server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// How a service's transports may share one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortSharing {
    /// A second transport of the owning service attaches to the existing
    /// reservation without a new bind.
    #[default]
    SameService,
    /// Every transport needs a port of its own.
    Exclusive,
}

/// Top-level network configuration for the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind address for every listener.
    pub host: String,
    pub port_sharing: PortSharing,
    /// Per-connection settings for push sockets.
    pub connection: ConnectionConfig,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete, in seconds.
    #[serde(deserialize_with = "seconds")]
    pub request_timeout: Duration,
    /// How long an unbind waits for in-flight work before aborting it, in
    /// seconds.
    #[serde(deserialize_with = "seconds")]
    pub drain_timeout: Duration,
    /// Largest accepted request body in bytes.
    pub body_limit: usize,
    /// Directory for per-service daily access logs. An empty path disables
    /// them.
    pub access_log_dir: Option<PathBuf>,
    /// Cookie carrying the managed session id.
    pub session_cookie: String,
    /// Idle time after which a managed session expires, in seconds. Zero
    /// keeps sessions until their listeners unbind.
    #[serde(deserialize_with = "seconds")]
    pub session_ttl: Duration,
}

impl NetworkConfig {
    /// Access log directory, unless disabled.
    #[must_use]
    pub fn access_log_dir(&self) -> Option<&Path> {
        self.access_log_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port_sharing: PortSharing::default(),
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            body_limit: 2 * 1024 * 1024,
            access_log_dir: Some(PathBuf::from("logs")),
            session_cookie: "switchyard.sid".to_string(),
            session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Per-connection configuration controlling push-socket backpressure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound messages per peer.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when sending a message to a peer, in seconds.
    #[serde(deserialize_with = "seconds")]
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
