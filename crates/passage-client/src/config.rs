//! Tunnel configuration

use bytes::Bytes;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default size of the connection pool.
pub const DEFAULT_MAX_CONNECTIONS: usize = 24;

/// Default heartbeat / reconnection interval.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(30_000);

/// A caller-supplied byte-stream mapper applied to traffic flowing from the
/// remote toward the local service.
pub type Transform = Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>;

/// Configuration validation errors. Fatal; no tunnel is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{0} must be in 1..=65535")]
    InvalidPort(&'static str),

    #[error("max_connections must be at least 1")]
    InvalidMaxConnections,

    #[error("private key is not a valid secp256k1 scalar")]
    InvalidPrivateKey,
}

/// Tunnel configuration. Immutable after construction.
#[derive(Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Hostname or IP of the local service to expose.
    pub local_address: String,

    /// Port of the local service.
    pub local_port: u16,

    /// Hostname of the remote rendezvous server.
    pub remote_address: String,

    /// Tunnel port on the remote rendezvous server.
    pub remote_port: u16,

    /// Size of the connection pool kept open to the remote.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Raw secp256k1 private key. Defines the tunnel identity.
    #[serde(with = "hex_key", default = "random_private_key")]
    pub private_key: [u8; 32],

    /// Dial the local service over TLS instead of plain TCP.
    #[serde(default)]
    pub secure_local_connection: bool,

    /// Whether to schedule replacement dials after the pool empties on error.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Heartbeat interval, also used as the error-reconnect delay.
    #[serde(with = "duration_millis", default = "default_reconnect_interval")]
    pub auto_reconnect_interval: Duration,

    /// Optional byte-stream transform applied remote-to-local.
    #[serde(skip)]
    pub transform: Option<Transform>,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_reconnect_interval() -> Duration {
    DEFAULT_RECONNECT_INTERVAL
}

fn default_true() -> bool {
    true
}

/// Generate a random private key that is a valid secp256k1 scalar.
pub fn random_private_key() -> [u8; 32] {
    loop {
        let candidate: [u8; 32] = rand::random();
        if SigningKey::from_bytes(&candidate.into()).is_ok() {
            return candidate;
        }
    }
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for serializing the private key as lowercase hex
mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("private key must be exactly 32 bytes"))
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("local_address", &self.local_address)
            .field("local_port", &self.local_port)
            .field("remote_address", &self.remote_address)
            .field("remote_port", &self.remote_port)
            .field("max_connections", &self.max_connections)
            .field("private_key", &"<redacted>")
            .field("secure_local_connection", &self.secure_local_connection)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("auto_reconnect_interval", &self.auto_reconnect_interval)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Validate the configuration. Called by the builder and by
    /// `Tunnel::new` for configs constructed directly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_address.is_empty() {
            return Err(ConfigError::MissingField("local_address"));
        }
        if self.remote_address.is_empty() {
            return Err(ConfigError::MissingField("remote_address"));
        }
        if self.local_port == 0 {
            return Err(ConfigError::InvalidPort("local_port"));
        }
        if self.remote_port == 0 {
            return Err(ConfigError::InvalidPort("remote_port"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        self.signing_key()?;
        Ok(())
    }

    /// Parse the private key into a signing key.
    pub(crate) fn signing_key(&self) -> Result<SigningKey, ConfigError> {
        SigningKey::from_bytes(&self.private_key.into()).map_err(|_| ConfigError::InvalidPrivateKey)
    }
}

/// Builder for TunnelConfig
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self {
            config: TunnelConfig {
                local_address: String::new(),
                local_port: 0,
                remote_address: String::new(),
                remote_port: 0,
                max_connections: DEFAULT_MAX_CONNECTIONS,
                private_key: random_private_key(),
                secure_local_connection: false,
                auto_reconnect: true,
                auto_reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
                transform: None,
            },
        }
    }
}

impl TunnelConfigBuilder {
    pub fn local_address(mut self, address: impl Into<String>) -> Self {
        self.config.local_address = address.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn remote_address(mut self, address: impl Into<String>) -> Self {
        self.config.remote_address = address.into();
        self
    }

    pub fn remote_port(mut self, port: u16) -> Self {
        self.config.remote_port = port;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    pub fn private_key(mut self, key: [u8; 32]) -> Self {
        self.config.private_key = key;
        self
    }

    pub fn secure_local_connection(mut self, secure: bool) -> Self {
        self.config.secure_local_connection = secure;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn auto_reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.auto_reconnect_interval = interval;
        self
    }

    /// Install a byte-stream transform applied to remote-to-local traffic.
    pub fn transform(mut self, transform: Transform) -> Self {
        self.config.transform = Some(transform);
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
