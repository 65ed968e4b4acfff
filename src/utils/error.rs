//! The `error` module defines the error type shared by every layer of the crate.
//!
//! Codec failures are split the way MQTT 3.1.1 splits them: `MalformedPacket`
//! for byte sequences that cannot be a packet at all, `ProtocolViolation` for
//! well-formed packets the protocol forbids. Both are fatal to the connection.
//! `ConnectionRefused` only occurs during the CONNECT handshake and carries the
//! return code that goes back to the peer in a CONNACK.

use thiserror::Error;

use crate::packet::ConnectReturnCode;

pub type Result<T> = std::result::Result<T, MqttError>;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("no session found for client {0}")]
    SessionNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MqttError {
    /// Whether the error must tear down the connection it happened on.
    ///
    /// Everything except a timeout waiting for a reply is terminal; timeouts
    /// only end the operation that was waiting.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MqttError::Timeout(_))
    }
}

impl From<sled::Error> for MqttError {
    fn from(err: sled::Error) -> Self {
        MqttError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MqttError {
    fn from(err: serde_json::Error) -> Self {
        MqttError::Storage(err.to_string())
    }
}
