//! # mqtt-flow
//!
//! `mqtt-flow` implements the MQTT 3.1.1 protocol flows for both ends of a
//! connection: a broker that accepts clients, routes publishes and keeps
//! persistent sessions, and a client that connects, subscribes and publishes
//! with QoS 0, 1 and 2.
//!
//! ## Core Modules
//!
//! - `packet`: The MQTT control packets as plain values.
//! - `codec`: Encoding and decoding of packets to and from wire frames.
//! - `topic`: Topic name and topic filter validation and matching.
//! - `transport`: Byte channels, frame buffering and packet channels.
//! - `session`: Client sessions, in-flight messages and packet identifiers.
//! - `persistence`: In-memory and sled-backed repositories.
//! - `flow`: The per-packet protocol flows shared by broker and client.
//! - `broker`: Connection listener, message router and the broker engine.
//! - `client`: The client facade and its listener.
//! - `config`: Settings loaded from files and `MQTT__*` environment variables.
//! - `utils`: Error type, logging bootstrap and binary helpers.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod flow;
pub mod packet;
pub mod persistence;
pub mod session;
pub mod topic;
pub mod transport;
pub mod utils;
