//! Session bookkeeping read and mutated by the protocol flows.
//!
//! A [`ClientSession`] carries everything that must survive a reconnect:
//! outbound publishes still waiting for their final acknowledgement, the
//! receiver side of unfinished QoS 2 handshakes and, on the broker, the
//! client's subscriptions. Retained messages and wills are stored next to the
//! sessions on the broker.

mod packet_id;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::packet::{Packet, PacketType, Publish, PublishReceived, PublishRelease, QoS, Will};
use crate::persistence::StorageObject;

pub use packet_id::PacketIdProvider;
pub use store::SessionRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingMessageStatus {
    /// Could not be sent yet; replayed with a fresh send on the next connect.
    PendingToSend,
    /// Sent and waiting for PUBACK or PUBREC.
    PendingToAcknowledge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub status: PendingMessageStatus,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl PendingMessage {
    pub fn from_publish(publish: &Publish, status: PendingMessageStatus) -> Self {
        Self {
            status,
            topic: publish.topic.clone(),
            qos: publish.qos,
            retain: publish.retain,
            duplicate: publish.duplicate,
            packet_id: publish.packet_id,
            payload: publish.payload.clone(),
        }
    }

    pub fn to_publish(&self) -> Publish {
        Publish {
            topic: self.topic.clone(),
            qos: self.qos,
            retain: self.retain,
            duplicate: self.duplicate,
            packet_id: self.packet_id,
            payload: self.payload.clone(),
        }
    }
}

/// Which QoS 2 reply this side still owes or awaits for `packet_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingAcknowledgementKind {
    PublishReceived,
    PublishRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAcknowledgement {
    pub packet_id: u16,
    pub kind: PendingAcknowledgementKind,
}

impl PendingAcknowledgement {
    pub fn new(packet_id: u16, kind: PendingAcknowledgementKind) -> Self {
        Self { packet_id, kind }
    }

    /// The ack packet to send again when the handshake is resumed.
    pub fn to_packet(&self) -> Packet {
        match self.kind {
            PendingAcknowledgementKind::PublishReceived => {
                PublishReceived::new(self.packet_id).into()
            }
            PendingAcknowledgementKind::PublishRelease => {
                PublishRelease::new(self.packet_id).into()
            }
        }
    }

    /// The kind recorded for an outgoing ack, if it is a QoS 2 ack.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        match packet {
            Packet::PublishReceived(ack) => Some(Self::new(
                ack.packet_id,
                PendingAcknowledgementKind::PublishReceived,
            )),
            Packet::PublishRelease(ack) => Some(Self::new(
                ack.packet_id,
                PendingAcknowledgementKind::PublishRelease,
            )),
            _ => None,
        }
    }

    /// Packet type that completes this step of the handshake.
    pub fn awaited_reply(&self) -> PacketType {
        match self.kind {
            PendingAcknowledgementKind::PublishReceived => PacketType::PublishRelease,
            PendingAcknowledgementKind::PublishRelease => PacketType::PublishComplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: String,
    pub topic_filter: String,
    pub maximum_qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: String,
    pub clean: bool,
    pub subscriptions: Vec<Subscription>,
    pub pending_messages: Vec<PendingMessage>,
    pub pending_acknowledgements: Vec<PendingAcknowledgement>,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, clean: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean,
            subscriptions: Vec::new(),
            pending_messages: Vec::new(),
            pending_acknowledgements: Vec::new(),
        }
    }

    /// Adds or replaces the subscription for the same topic filter.
    pub fn add_subscription(&mut self, topic_filter: &str, maximum_qos: QoS) {
        self.remove_subscription(topic_filter);
        self.subscriptions.push(Subscription {
            client_id: self.client_id.clone(),
            topic_filter: topic_filter.to_string(),
            maximum_qos,
        });
    }

    pub fn remove_subscription(&mut self, topic_filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|subscription| subscription.topic_filter != topic_filter);
        before != self.subscriptions.len()
    }

    /// Replaces any pending message that uses the same packet id.
    pub fn add_pending_message(&mut self, message: PendingMessage) {
        if message.packet_id.is_some() {
            self.remove_pending_message(message.packet_id);
        }
        self.pending_messages.push(message);
    }

    pub fn remove_pending_message(&mut self, packet_id: Option<u16>) -> bool {
        let before = self.pending_messages.len();
        self.pending_messages
            .retain(|message| message.packet_id != packet_id);
        before != self.pending_messages.len()
    }

    pub fn add_pending_acknowledgement(&mut self, acknowledgement: PendingAcknowledgement) {
        if !self.pending_acknowledgements.contains(&acknowledgement) {
            self.pending_acknowledgements.push(acknowledgement);
        }
    }

    pub fn has_pending_acknowledgement(&self, acknowledgement: &PendingAcknowledgement) -> bool {
        self.pending_acknowledgements.contains(acknowledgement)
    }

    pub fn remove_pending_acknowledgement(&mut self, acknowledgement: &PendingAcknowledgement) -> bool {
        let before = self.pending_acknowledgements.len();
        self.pending_acknowledgements
            .retain(|pending| pending != acknowledgement);
        before != self.pending_acknowledgements.len()
    }
}

impl StorageObject for ClientSession {
    const COLLECTION: &'static str = "sessions";

    fn id(&self) -> String {
        self.client_id.clone()
    }
}

/// Last retained publish of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl RetainedMessage {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload,
            stored_at: Utc::now(),
        }
    }
}

impl StorageObject for RetainedMessage {
    const COLLECTION: &'static str = "retained";

    fn id(&self) -> String {
        self.topic.clone()
    }
}

/// Will registered by a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionWill {
    pub client_id: String,
    pub will: Will,
}

impl ConnectionWill {
    pub fn new(client_id: impl Into<String>, will: Will) -> Self {
        Self {
            client_id: client_id.into(),
            will,
        }
    }

    /// The publish sent on the client's behalf. Routing assigns packet ids.
    pub fn to_publish(&self) -> Publish {
        Publish {
            topic: self.will.topic.clone(),
            qos: self.will.qos,
            retain: self.will.retain,
            duplicate: false,
            packet_id: None,
            payload: self.will.payload.clone(),
        }
    }
}

impl StorageObject for ConnectionWill {
    const COLLECTION: &'static str = "wills";

    fn id(&self) -> String {
        self.client_id.clone()
    }
}
