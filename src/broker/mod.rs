//! The `broker` module serves MQTT clients.
//!
//! A [`Broker`] accepts byte channels, runs one [`ServerPacketListener`] per
//! connection and routes every accepted publish through its
//! [`MessageRouter`] to the sessions subscribed to it.

pub mod connections;
pub mod engine;
pub mod listener;
pub mod router;

pub use connections::{Connection, ConnectionRegistry};
pub use engine::Broker;
pub use listener::{ServerPacketListener, anonymous_client_id};
pub use router::MessageRouter;
