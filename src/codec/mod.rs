//! Binary encoding and decoding of MQTT 3.1.1 control packets.
//!
//! [`PacketCodec`] is the registry: it reads the packet type from the first
//! byte of a frame, checks the fixed header and hands the body to the
//! per-type decoder. Encoding goes the other way and re-checks every
//! invariant the decoder enforces before a byte is written.

mod ack;
mod connect;
mod publish;
mod subscribe;

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::packet::{Packet, PacketType};
use crate::topic::TopicEvaluator;
use crate::utils::binary::extract_bits;
use crate::utils::error::{MqttError, Result};

/// Largest value the remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

pub const PROTOCOL_NAME: &str = "MQTT";

pub const PROTOCOL_LEVEL: u8 = 4;

/// Incremental decoder for the variable-length remaining length field.
#[derive(Debug, Default, Clone)]
pub(crate) struct RemainingLength {
    value: usize,
    consumed: usize,
}

impl RemainingLength {
    /// Feeds one encoded byte. Returns the decoded length once a byte without
    /// the continuation bit arrives.
    pub(crate) fn push(&mut self, byte: u8) -> Result<Option<usize>> {
        self.value += ((byte & 0x7F) as usize) << (7 * self.consumed);
        self.consumed += 1;

        if byte & 0x80 == 0 {
            Ok(Some(self.value))
        } else if self.consumed == 4 {
            // a fifth byte would be needed
            Err(MqttError::MalformedPacket(
                "remaining length uses more than four bytes".to_string(),
            ))
        } else {
            Ok(None)
        }
    }
}

pub fn encode_remaining_length(mut length: usize) -> Result<Vec<u8>> {
    if length > MAX_REMAINING_LENGTH {
        return Err(MqttError::MalformedPacket(format!(
            "remaining length {length} exceeds {MAX_REMAINING_LENGTH}"
        )));
    }
    let mut encoded = Vec::with_capacity(4);
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        encoded.push(byte);
        if length == 0 {
            return Ok(encoded);
        }
    }
}

/// Decodes a remaining length at the start of `bytes`, returning the value
/// and how many bytes it occupied.
pub fn decode_remaining_length(bytes: &[u8]) -> Result<(usize, usize)> {
    let mut decoder = RemainingLength::default();
    for (index, byte) in bytes.iter().enumerate() {
        if let Some(length) = decoder.push(*byte)? {
            return Ok((length, index + 1));
        }
    }
    Err(MqttError::MalformedPacket(
        "remaining length is truncated".to_string(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: usize,
    /// Bytes taken by the fixed header itself.
    pub length: usize,
}

impl FixedHeader {
    pub(crate) fn read(frame: &[u8]) -> Result<Self> {
        let first = *frame
            .first()
            .ok_or_else(|| MqttError::MalformedPacket("empty frame".to_string()))?;
        let packet_type = PacketType::try_from(extract_bits(first, 4)?)?;
        let (remaining_length, consumed) = decode_remaining_length(&frame[1..])?;

        Ok(Self {
            packet_type,
            flags: first & 0x0F,
            remaining_length,
            length: 1 + consumed,
        })
    }

    /// Flags every packet type except PUBLISH must carry.
    pub(crate) fn reserved_flags(packet_type: PacketType) -> u8 {
        match packet_type {
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0,
        }
    }

    fn check_reserved_flags(&self) -> Result<()> {
        let expected = Self::reserved_flags(self.packet_type);
        if self.flags == expected {
            return Ok(());
        }
        let message = format!(
            "{:?} header flags must be 0x{expected:X}, got 0x{:X}",
            self.packet_type, self.flags
        );
        match self.packet_type {
            PacketType::PingRequest | PacketType::PingResponse | PacketType::Disconnect => {
                Err(MqttError::MalformedPacket(message))
            }
            _ => Err(MqttError::ProtocolViolation(message)),
        }
    }
}

/// Builds a complete frame from the first header byte and an encoded body.
pub(crate) fn frame(packet_type: PacketType, flags: u8, body: &[u8]) -> Result<Vec<u8>> {
    let remaining = encode_remaining_length(body.len())?;
    let mut buf = BytesMut::with_capacity(1 + remaining.len() + body.len());
    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    buf.put_slice(&remaining);
    buf.put_slice(body);
    Ok(buf.to_vec())
}

pub(crate) fn ensure_consumed(packet_type: PacketType, body: &[u8], index: usize) -> Result<()> {
    if index != body.len() {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} has {} unexpected trailing bytes",
            body.len().saturating_sub(index)
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PacketCodec {
    topics: Arc<dyn TopicEvaluator>,
    client_id_max_length: usize,
}

impl std::fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCodec")
            .field("client_id_max_length", &self.client_id_max_length)
            .finish()
    }
}

impl PacketCodec {
    pub fn new(topics: Arc<dyn TopicEvaluator>, client_id_max_length: usize) -> Self {
        Self {
            topics,
            client_id_max_length,
        }
    }

    /// Decodes one complete frame, dispatching on its packet type.
    pub fn decode(&self, frame: &[u8]) -> Result<Packet> {
        let header = FixedHeader::read(frame)?;
        self.decode_as(header.packet_type, frame)
    }

    /// Decodes `frame` with the decoder for `expected`. A frame of any other
    /// type is malformed.
    pub fn decode_as(&self, expected: PacketType, frame: &[u8]) -> Result<Packet> {
        let header = FixedHeader::read(frame)?;
        if header.packet_type != expected {
            return Err(MqttError::MalformedPacket(format!(
                "expected a {expected:?} packet, got {:?}",
                header.packet_type
            )));
        }
        let body = &frame[header.length..];
        if body.len() != header.remaining_length {
            return Err(MqttError::MalformedPacket(format!(
                "remaining length is {} but {} bytes follow the header",
                header.remaining_length,
                body.len()
            )));
        }
        if expected != PacketType::Publish {
            header.check_reserved_flags()?;
        }

        let packet = match expected {
            PacketType::Connect => {
                Packet::Connect(connect::decode_connect(
                    body,
                    self.client_id_max_length,
                    self.topics.as_ref(),
                )?)
            }
            PacketType::ConnectAck => Packet::ConnectAck(connect::decode_connect_ack(body)?),
            PacketType::Publish => {
                Packet::Publish(publish::decode(header.flags, body, self.topics.as_ref())?)
            }
            PacketType::PublishAck
            | PacketType::PublishReceived
            | PacketType::PublishRelease
            | PacketType::PublishComplete
            | PacketType::UnsubscribeAck => ack::decode_id_only(expected, body)?,
            PacketType::Subscribe => Packet::Subscribe(subscribe::decode_subscribe(body)?),
            PacketType::SubscribeAck => {
                Packet::SubscribeAck(subscribe::decode_subscribe_ack(body)?)
            }
            PacketType::Unsubscribe => Packet::Unsubscribe(subscribe::decode_unsubscribe(body)?),
            PacketType::PingRequest | PacketType::PingResponse | PacketType::Disconnect => {
                ack::decode_empty(expected, body)?
            }
        };
        Ok(packet)
    }

    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        match packet {
            Packet::Connect(connect) => {
                connect::encode_connect(connect, self.client_id_max_length, self.topics.as_ref())
            }
            Packet::ConnectAck(ack) => connect::encode_connect_ack(ack),
            Packet::Publish(publish) => publish::encode(publish, self.topics.as_ref()),
            Packet::PublishAck(ack) => ack::encode_id_only(PacketType::PublishAck, ack.packet_id),
            Packet::PublishReceived(ack) => {
                ack::encode_id_only(PacketType::PublishReceived, ack.packet_id)
            }
            Packet::PublishRelease(ack) => {
                ack::encode_id_only(PacketType::PublishRelease, ack.packet_id)
            }
            Packet::PublishComplete(ack) => {
                ack::encode_id_only(PacketType::PublishComplete, ack.packet_id)
            }
            Packet::Subscribe(subscribe) => subscribe::encode_subscribe(subscribe),
            Packet::SubscribeAck(ack) => subscribe::encode_subscribe_ack(ack),
            Packet::Unsubscribe(unsubscribe) => subscribe::encode_unsubscribe(unsubscribe),
            Packet::UnsubscribeAck(ack) => {
                ack::encode_id_only(PacketType::UnsubscribeAck, ack.packet_id)
            }
            Packet::PingRequest => frame(PacketType::PingRequest, 0, &[]),
            Packet::PingResponse => frame(PacketType::PingResponse, 0, &[]),
            Packet::Disconnect => frame(PacketType::Disconnect, 0, &[]),
        }
    }
}
