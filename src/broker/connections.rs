use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::transport::PacketChannel;

/// One live connection of a client.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub channel: PacketChannel,
}

impl Connection {
    pub fn new(channel: PacketChannel) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
        }
    }
}

/// Live connections by client id, shared by the listeners and the router.
///
/// A client id maps to at most one connection. Entries are only removed by
/// the connection that owns them, so a listener torn down after a takeover
/// leaves its successor registered.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Connection>>,
    handover: Arc<Mutex<()>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes session setup of a new connection against the teardown
    /// of an old one. Never held across an await.
    pub(crate) fn handover(&self) -> MutexGuard<'_, ()> {
        self.handover.lock()
    }

    /// Registers `connection` and returns the one it replaced.
    pub fn register(&self, client_id: &str, connection: Connection) -> Option<Connection> {
        self.connections.insert(client_id.to_string(), connection)
    }

    /// Removes the entry of `client_id` if it still belongs to `connection_id`.
    pub fn remove(&self, client_id: &str, connection_id: Uuid) -> bool {
        self.connections
            .remove_if(client_id, |_, connection| connection.id == connection_id)
            .is_some()
    }

    pub fn get(&self, client_id: &str) -> Option<PacketChannel> {
        self.connections
            .get(client_id)
            .map(|connection| connection.channel.clone())
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
