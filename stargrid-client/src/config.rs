use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The top-level configuration for the `stargrid-client` library.
///
/// Aggregates the server endpoint, connection behavior and channel
/// capacities. Typically deserialized from a configuration file and passed
/// to [`crate::client::StargridClient::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    /// WebSocket endpoint of the Stargrid server.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// How long `connect` waits for the transport to report "open".
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub channels: ChannelConfig,
}

/// Defines capacities for the various channels within the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelConfig {
    /// Capacity of the block broadcast channel.
    pub block_event_buffer: usize,
    /// Capacity of each per-subscription transaction channel.
    pub subscription_event_buffer: usize,
    /// Capacity of the command channel to the dispatcher.
    pub dispatcher_command_buffer: usize,
    /// Capacity of the outbound frame queue to the transport writer.
    pub outbound_frame_buffer: usize,
    /// Capacity of the shared error broadcast channel.
    pub error_event_buffer: usize,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Loads the configuration from a TOML file, with `STARGRID__`-prefixed
    /// environment variables taking precedence over file values.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("STARGRID").separator("__"))
            .build()?
            .try_deserialize()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            channels: ChannelConfig::default(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            block_event_buffer: 256,
            subscription_event_buffer: 128,
            dispatcher_command_buffer: 128,
            outbound_frame_buffer: 64,
            error_event_buffer: 64,
        }
    }
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:27043".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}
