use super::{FixedHeader, frame};
use crate::packet::{
    Packet, PacketType, PublishAck, PublishComplete, PublishReceived, PublishRelease,
    UnsubscribeAck,
};
use crate::utils::binary::read_u16;
use crate::utils::error::{MqttError, Result};

/// Packet id 0 is reserved in every packet that carries one.
pub(super) fn check_packet_id(packet_type: PacketType, packet_id: u16) -> Result<u16> {
    if packet_id == 0 {
        return Err(MqttError::ProtocolViolation(format!(
            "{packet_type:?} must not use packet id 0"
        )));
    }
    Ok(packet_id)
}

/// Packets whose whole body is the two byte packet identifier.
pub(super) fn decode_id_only(packet_type: PacketType, body: &[u8]) -> Result<Packet> {
    if body.len() != 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} body must be 2 bytes, got {}",
            body.len()
        )));
    }
    let packet_id = check_packet_id(packet_type, read_u16(body, 0)?)?;
    let packet = match packet_type {
        PacketType::PublishAck => PublishAck::new(packet_id).into(),
        PacketType::PublishReceived => PublishReceived::new(packet_id).into(),
        PacketType::PublishRelease => PublishRelease::new(packet_id).into(),
        PacketType::PublishComplete => PublishComplete::new(packet_id).into(),
        PacketType::UnsubscribeAck => UnsubscribeAck::new(packet_id).into(),
        other => {
            return Err(MqttError::MalformedPacket(format!(
                "{other:?} is not an identifier-only packet"
            )));
        }
    };
    Ok(packet)
}

pub(super) fn encode_id_only(packet_type: PacketType, packet_id: u16) -> Result<Vec<u8>> {
    check_packet_id(packet_type, packet_id)?;
    frame(
        packet_type,
        FixedHeader::reserved_flags(packet_type),
        &packet_id.to_be_bytes(),
    )
}

pub(super) fn decode_empty(packet_type: PacketType, body: &[u8]) -> Result<Packet> {
    if !body.is_empty() {
        return Err(MqttError::MalformedPacket(format!(
            "{packet_type:?} must have an empty body, got {} bytes",
            body.len()
        )));
    }
    match packet_type {
        PacketType::PingRequest => Ok(Packet::PingRequest),
        PacketType::PingResponse => Ok(Packet::PingResponse),
        PacketType::Disconnect => Ok(Packet::Disconnect),
        other => Err(MqttError::MalformedPacket(format!(
            "{other:?} is not an empty packet"
        ))),
    }
}
