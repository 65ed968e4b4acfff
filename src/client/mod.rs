//! The `client` module is the application side of an MQTT connection.
//!
//! [`MqttClient`] sends CONNECT, SUBSCRIBE, UNSUBSCRIBE and PUBLISH over a
//! byte channel and exposes received publishes as [`ApplicationMessage`]s.
//! Its [`ClientPacketListener`] runs the client flows for everything the
//! broker sends.

pub mod listener;
pub mod message;
pub mod pubsub_client;

pub use listener::ClientPacketListener;
pub use message::{ApplicationMessage, Credentials, SessionState};
pub use pubsub_client::MqttClient;
