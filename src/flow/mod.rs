//! The `flow` module implements the protocol exchanges one packet at a time.
//!
//! Each flow handles the packets of one exchange for a client: it reads and
//! updates that client's session and replies over the connection's
//! [`PacketChannel`]. [`ServerFlows`] and [`ClientFlows`] route an inbound
//! packet to its flow with a plain match on the packet variant. Anything that
//! waits for a reply runs in its own task so a flow never blocks the
//! connection's worker.

mod ack_monitor;
mod connect;
mod publish_receiver;
mod publish_sender;
mod subscribe;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::ProtocolSettings;
use crate::packet::{Packet, Publish};
use crate::persistence::{Repository, RepositoryProvider};
use crate::session::{ConnectionWill, SessionRepository};
use crate::topic::TopicEvaluator;
use crate::transport::PacketChannel;
use crate::utils::error::{MqttError, Result};

pub use connect::{Authenticator, ClientConnectFlow, ServerConnectFlow};
pub use publish_receiver::PublishReceiverFlow;
pub use publish_sender::{PublishAcknowledger, PublishSenderFlow};
pub use subscribe::{SubscribeFlow, UnsubscribeFlow};
pub(crate) use worker::FlowWorker;

/// Receives every publish a receiver flow accepted, after it was
/// acknowledged. The broker routes it to subscribers, the client hands it to
/// the application.
pub trait PublishDispatcher: Send + Sync {
    fn dispatch(&self, client_id: &str, publish: Publish) -> Result<()>;
}

/// How long a connection may stay silent: one and a half keep-alive periods.
/// `None` when keep-alive is disabled.
pub fn keep_alive_limit(keep_alive_secs: u16) -> Option<Duration> {
    (keep_alive_secs > 0).then(|| Duration::from_millis(u64::from(keep_alive_secs) * 1500))
}

/// Answers PINGREQ.
pub fn ping(channel: &PacketChannel) -> Result<()> {
    channel.send(&Packet::PingResponse)
}

/// Broker side of DISCONNECT: a graceful disconnect discards the will.
#[derive(Clone)]
pub struct DisconnectFlow {
    wills: Arc<dyn Repository<ConnectionWill>>,
}

impl std::fmt::Debug for DisconnectFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisconnectFlow").finish_non_exhaustive()
    }
}

impl DisconnectFlow {
    pub fn new(wills: Arc<dyn Repository<ConnectionWill>>) -> Self {
        Self { wills }
    }

    pub fn execute(&self, client_id: &str) -> Result<()> {
        debug!("{client_id} disconnected");
        self.wills.delete(client_id)
    }
}

/// Every flow a broker connection runs after its CONNECT.
#[derive(Debug, Clone)]
pub struct ServerFlows {
    pub connect: ServerConnectFlow,
    pub sender: PublishSenderFlow,
    pub receiver: PublishReceiverFlow,
    pub subscribe: SubscribeFlow,
    pub unsubscribe: UnsubscribeFlow,
    pub disconnect: DisconnectFlow,
}

impl ServerFlows {
    /// `sender` is shared with whatever routes publishes to this broker's
    /// clients so both sides of the handshake use the same session store.
    pub fn new(
        repositories: &RepositoryProvider,
        settings: &ProtocolSettings,
        topics: Arc<dyn TopicEvaluator>,
        sender: PublishSenderFlow,
        dispatcher: Arc<dyn PublishDispatcher>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let sessions = repositories.sessions.clone();
        Self {
            connect: ServerConnectFlow::new(
                sessions.clone(),
                repositories.wills.clone(),
                sender.clone(),
                authenticator,
            ),
            receiver: PublishReceiverFlow::new(
                sessions.clone(),
                sender.acknowledger().clone(),
                settings.maximum_qos,
                dispatcher,
            ),
            subscribe: SubscribeFlow::new(
                sessions.clone(),
                repositories.retained.clone(),
                topics,
                sender.clone(),
                settings.maximum_qos,
            ),
            unsubscribe: UnsubscribeFlow::new(sessions),
            disconnect: DisconnectFlow::new(repositories.wills.clone()),
            sender,
        }
    }

    pub fn execute(&self, client_id: &str, packet: Packet, channel: &PacketChannel) -> Result<()> {
        trace!("{client_id}: executing {:?}", packet.packet_type());
        match packet {
            Packet::Connect(connect) => self.connect.execute(client_id, &connect, channel),
            Packet::Publish(_) | Packet::PublishRelease(_) => {
                self.receiver.execute(client_id, packet, channel)
            }
            Packet::PublishAck(_) | Packet::PublishReceived(_) | Packet::PublishComplete(_) => {
                self.sender.execute(client_id, &packet, channel)
            }
            Packet::Subscribe(subscribe) => self.subscribe.execute(client_id, subscribe, channel),
            Packet::Unsubscribe(unsubscribe) => {
                self.unsubscribe.execute(client_id, unsubscribe, channel)
            }
            Packet::PingRequest => ping(channel),
            Packet::Disconnect => self.disconnect.execute(client_id),
            other => Err(MqttError::ProtocolViolation(format!(
                "a broker does not accept {:?}",
                other.packet_type()
            ))),
        }
    }
}

/// Every flow a client connection runs.
#[derive(Debug, Clone)]
pub struct ClientFlows {
    pub connect: ClientConnectFlow,
    pub sender: PublishSenderFlow,
    pub receiver: PublishReceiverFlow,
}

impl ClientFlows {
    pub fn new(
        sessions: SessionRepository,
        settings: &ProtocolSettings,
        dispatcher: Arc<dyn PublishDispatcher>,
    ) -> Self {
        let sender = PublishSenderFlow::new(sessions.clone(), settings.wait_timeout());
        Self {
            connect: ClientConnectFlow::new(sessions.clone(), sender.clone()),
            receiver: PublishReceiverFlow::new(
                sessions,
                sender.acknowledger().clone(),
                settings.maximum_qos,
                dispatcher,
            ),
            sender,
        }
    }

    pub fn execute(&self, client_id: &str, packet: Packet, channel: &PacketChannel) -> Result<()> {
        trace!("{client_id}: executing {:?}", packet.packet_type());
        match packet {
            Packet::ConnectAck(ack) => self.connect.execute(client_id, &ack, channel),
            Packet::Publish(_) | Packet::PublishRelease(_) => {
                self.receiver.execute(client_id, packet, channel)
            }
            Packet::PublishAck(_) | Packet::PublishReceived(_) | Packet::PublishComplete(_) => {
                self.sender.execute(client_id, &packet, channel)
            }
            // awaited by the client operations themselves
            Packet::SubscribeAck(_) | Packet::UnsubscribeAck(_) | Packet::PingResponse => Ok(()),
            other => Err(MqttError::ProtocolViolation(format!(
                "a client does not accept {:?}",
                other.packet_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests;
