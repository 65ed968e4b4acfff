//! The `packet` module defines the MQTT 3.1.1 control packets as plain values.
//!
//! Every variant of [`Packet`] only carries protocol-relevant fields. Packets
//! can be built by hand, so the codec re-validates every invariant on encode;
//! constructing an invalid value here is possible but it will never reach the
//! wire.

use serde::{Deserialize, Serialize};

use crate::utils::error::MqttError;

/// Delivery guarantee of a PUBLISH or a subscription.
///
/// Serialized as its numeric level so configuration files and stored sessions
/// read `0`, `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::ProtocolViolation(format!(
                "{other} is not a valid QoS level"
            ))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Connect = 1,
    ConnectAck = 2,
    Publish = 3,
    PublishAck = 4,
    PublishReceived = 5,
    PublishRelease = 6,
    PublishComplete = 7,
    Subscribe = 8,
    SubscribeAck = 9,
    Unsubscribe = 10,
    UnsubscribeAck = 11,
    PingRequest = 12,
    PingResponse = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let packet_type = match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnectAck,
            3 => PacketType::Publish,
            4 => PacketType::PublishAck,
            5 => PacketType::PublishReceived,
            6 => PacketType::PublishRelease,
            7 => PacketType::PublishComplete,
            8 => PacketType::Subscribe,
            9 => PacketType::SubscribeAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubscribeAck,
            12 => PacketType::PingRequest,
            13 => PacketType::PingResponse,
            14 => PacketType::Disconnect,
            other => {
                return Err(MqttError::MalformedPacket(format!(
                    "{other} is not a valid packet type"
                )));
            }
        };
        Ok(packet_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(MqttError::MalformedPacket(format!(
                "{other} is not a valid CONNACK return code"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeReturnCode {
    MaximumQoS0 = 0x00,
    MaximumQoS1 = 0x01,
    MaximumQoS2 = 0x02,
    Failure = 0x80,
}

impl SubscribeReturnCode {
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => SubscribeReturnCode::MaximumQoS0,
            QoS::AtLeastOnce => SubscribeReturnCode::MaximumQoS1,
            QoS::ExactlyOnce => SubscribeReturnCode::MaximumQoS2,
        }
    }
}

impl TryFrom<u8> for SubscribeReturnCode {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(SubscribeReturnCode::MaximumQoS0),
            0x01 => Ok(SubscribeReturnCode::MaximumQoS1),
            0x02 => Ok(SubscribeReturnCode::MaximumQoS2),
            0x80 => Ok(SubscribeReturnCode::Failure),
            other => Err(MqttError::ProtocolViolation(format!(
                "0x{other:02X} is not a valid SUBACK return code"
            ))),
        }
    }
}

/// Last Will and Testament carried by a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive: 0,
            will: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub return_code: ConnectReturnCode,
    pub session_present: bool,
}

impl ConnectAck {
    pub fn new(return_code: ConnectReturnCode, session_present: bool) -> Self {
        Self {
            return_code,
            session_present,
        }
    }
}

/// PUBLISH packet. `packet_id` is present exactly when `qos` is above
/// `AtMostOnce`, and `duplicate` is only allowed together with a packet id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl Publish {
    pub fn new(
        topic: impl Into<String>,
        qos: QoS,
        packet_id: Option<u16>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain: false,
            duplicate: false,
            packet_id,
            payload: payload.into(),
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_duplicate(mut self, duplicate: bool) -> Self {
        self.duplicate = duplicate;
        self
    }
}

macro_rules! id_only_packet {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl $name {
            pub fn new(packet_id: u16) -> Self {
                Self { packet_id }
            }
        }
    };
}

id_only_packet!(
    /// QoS 1 acknowledgement.
    PublishAck
);
id_only_packet!(
    /// First reply of the QoS 2 handshake.
    PublishReceived
);
id_only_packet!(PublishRelease);
id_only_packet!(
    /// Final reply of the QoS 2 handshake.
    PublishComplete
);
id_only_packet!(UnsubscribeAck);

/// One entry of a SUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub topic_filter: String,
    pub maximum_qos: QoS,
}

impl TopicSubscription {
    pub fn new(topic_filter: impl Into<String>, maximum_qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            maximum_qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<TopicSubscription>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck(PublishAck),
    PublishReceived(PublishReceived),
    PublishRelease(PublishRelease),
    PublishComplete(PublishComplete),
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    UnsubscribeAck(UnsubscribeAck),
    PingRequest,
    PingResponse,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnectAck(_) => PacketType::ConnectAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PublishAck(_) => PacketType::PublishAck,
            Packet::PublishReceived(_) => PacketType::PublishReceived,
            Packet::PublishRelease(_) => PacketType::PublishRelease,
            Packet::PublishComplete(_) => PacketType::PublishComplete,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubscribeAck(_) => PacketType::SubscribeAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubscribeAck(_) => PacketType::UnsubscribeAck,
            Packet::PingRequest => PacketType::PingRequest,
            Packet::PingResponse => PacketType::PingResponse,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier of the packets that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PublishAck(p) => Some(p.packet_id),
            Packet::PublishReceived(p) => Some(p.packet_id),
            Packet::PublishRelease(p) => Some(p.packet_id),
            Packet::PublishComplete(p) => Some(p.packet_id),
            Packet::Subscribe(p) => Some(p.packet_id),
            Packet::SubscribeAck(p) => Some(p.packet_id),
            Packet::Unsubscribe(p) => Some(p.packet_id),
            Packet::UnsubscribeAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// Whether this packet is the `packet_type` reply for `packet_id`.
    pub fn is_reply(&self, packet_type: PacketType, packet_id: u16) -> bool {
        self.packet_type() == packet_type && self.packet_id() == Some(packet_id)
    }
}

macro_rules! into_packet {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Packet {
                fn from(packet: $variant) -> Self {
                    Packet::$variant(packet)
                }
            }
        )*
    };
}

into_packet!(
    Connect,
    ConnectAck,
    Publish,
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
);

#[cfg(test)]
mod tests;
