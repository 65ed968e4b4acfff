use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

use crate::packet::QoS;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub protocol: ProtocolSettings,
    pub storage: StorageSettings,
}

/// Address the broker listens on and clients connect to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Knobs of the protocol flows shared by client and broker.
#[derive(Debug, Deserialize, Clone)]
pub struct ProtocolSettings {
    /// Highest QoS granted to subscriptions and accepted on inbound publishes.
    pub maximum_qos: QoS,
    /// Keep-alive a client announces in CONNECT; 0 disables it.
    pub keep_alive_secs: u16,
    /// Period between retransmissions of an unacknowledged packet.
    pub wait_timeout_secs: u64,
    /// How long a CONNECT, CONNACK, SUBACK or UNSUBACK may take to arrive.
    pub connection_timeout_secs: u64,
    pub client_id_max_length: usize,
    pub allow_wildcards_in_topic_filters: bool,
}

impl ProtocolSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Rejects values the flows cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "protocol.wait_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.connection_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "protocol.connection_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where sessions, retained messages and wills are kept.
///
/// Without a path everything lives in memory.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub protocol: Option<PartialProtocolSettings>,
    pub storage: Option<PartialStorageSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialProtocolSettings {
    pub maximum_qos: Option<QoS>,
    pub keep_alive_secs: Option<u16>,
    pub wait_timeout_secs: Option<u64>,
    pub connection_timeout_secs: Option<u64>,
    pub client_id_max_length: Option<usize>,
    pub allow_wildcards_in_topic_filters: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            maximum_qos: QoS::ExactlyOnce,
            keep_alive_secs: 0,
            wait_timeout_secs: 5,
            connection_timeout_secs: 5,
            client_id_max_length: u16::MAX as usize,
            allow_wildcards_in_topic_filters: true,
        }
    }
}
