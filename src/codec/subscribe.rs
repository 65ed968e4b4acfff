use bytes::{BufMut, BytesMut};

use super::ack::check_packet_id;
use super::{FixedHeader, frame};
use crate::packet::{
    PacketType, QoS, Subscribe, SubscribeAck, SubscribeReturnCode, TopicSubscription, Unsubscribe,
};
use crate::utils::binary::{read_string_at, read_u16, write_string, write_u16};
use crate::utils::error::{MqttError, Result};

fn read_packet_id(packet_type: PacketType, body: &[u8]) -> Result<u16> {
    check_packet_id(packet_type, read_u16(body, 0)?)
}

fn check_topic(packet_type: PacketType, topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(MqttError::ProtocolViolation(format!(
            "{packet_type:?} topic filters must not be empty"
        )));
    }
    Ok(())
}

pub(super) fn decode_subscribe(body: &[u8]) -> Result<Subscribe> {
    let packet_id = read_packet_id(PacketType::Subscribe, body)?;
    let mut index = 2;
    let mut subscriptions = Vec::new();

    while index < body.len() {
        let (topic_filter, next) = read_string_at(body, index)?;
        check_topic(PacketType::Subscribe, &topic_filter)?;
        let requested = *body.get(next).ok_or_else(|| {
            MqttError::MalformedPacket(format!("no requested QoS for {topic_filter:?}"))
        })?;
        // upper six bits are reserved, so anything above 2 is invalid
        let maximum_qos = QoS::try_from(requested)?;
        subscriptions.push(TopicSubscription {
            topic_filter,
            maximum_qos,
        });
        index = next + 1;
    }

    if subscriptions.is_empty() {
        return Err(MqttError::ProtocolViolation(
            "SUBSCRIBE must contain at least one topic filter".to_string(),
        ));
    }
    Ok(Subscribe {
        packet_id,
        subscriptions,
    })
}

pub(super) fn encode_subscribe(subscribe: &Subscribe) -> Result<Vec<u8>> {
    if subscribe.subscriptions.is_empty() {
        return Err(MqttError::ProtocolViolation(
            "SUBSCRIBE must contain at least one topic filter".to_string(),
        ));
    }
    check_packet_id(PacketType::Subscribe, subscribe.packet_id)?;
    let mut body = BytesMut::new();
    write_u16(&mut body, subscribe.packet_id);
    for subscription in &subscribe.subscriptions {
        check_topic(PacketType::Subscribe, &subscription.topic_filter)?;
        write_string(&mut body, &subscription.topic_filter)?;
        body.put_u8(subscription.maximum_qos as u8);
    }
    frame(
        PacketType::Subscribe,
        FixedHeader::reserved_flags(PacketType::Subscribe),
        &body,
    )
}

pub(super) fn decode_subscribe_ack(body: &[u8]) -> Result<SubscribeAck> {
    let packet_id = read_packet_id(PacketType::SubscribeAck, body)?;
    let return_codes = body[2..]
        .iter()
        .map(|code| SubscribeReturnCode::try_from(*code))
        .collect::<Result<Vec<_>>>()?;
    if return_codes.is_empty() {
        return Err(MqttError::ProtocolViolation(
            "SUBACK must contain at least one return code".to_string(),
        ));
    }
    Ok(SubscribeAck {
        packet_id,
        return_codes,
    })
}

pub(super) fn encode_subscribe_ack(ack: &SubscribeAck) -> Result<Vec<u8>> {
    if ack.return_codes.is_empty() {
        return Err(MqttError::ProtocolViolation(
            "SUBACK must contain at least one return code".to_string(),
        ));
    }
    check_packet_id(PacketType::SubscribeAck, ack.packet_id)?;
    let mut body = BytesMut::with_capacity(2 + ack.return_codes.len());
    write_u16(&mut body, ack.packet_id);
    for code in &ack.return_codes {
        body.put_u8(*code as u8);
    }
    frame(PacketType::SubscribeAck, 0, &body)
}

pub(super) fn decode_unsubscribe(body: &[u8]) -> Result<Unsubscribe> {
    let packet_id = read_packet_id(PacketType::Unsubscribe, body)?;
    let mut index = 2;
    let mut topics = Vec::new();

    while index < body.len() {
        let (topic, next) = read_string_at(body, index)?;
        check_topic(PacketType::Unsubscribe, &topic)?;
        topics.push(topic);
        index = next;
    }

    if topics.is_empty() {
        return Err(MqttError::ProtocolViolation(
            "UNSUBSCRIBE must contain at least one topic filter".to_string(),
        ));
    }
    Ok(Unsubscribe { packet_id, topics })
}

pub(super) fn encode_unsubscribe(unsubscribe: &Unsubscribe) -> Result<Vec<u8>> {
    if unsubscribe.topics.is_empty() {
        return Err(MqttError::ProtocolViolation(
            "UNSUBSCRIBE must contain at least one topic filter".to_string(),
        ));
    }
    check_packet_id(PacketType::Unsubscribe, unsubscribe.packet_id)?;
    let mut body = BytesMut::new();
    write_u16(&mut body, unsubscribe.packet_id);
    for topic in &unsubscribe.topics {
        check_topic(PacketType::Unsubscribe, topic)?;
        write_string(&mut body, topic)?;
    }
    frame(
        PacketType::Unsubscribe,
        FixedHeader::reserved_flags(PacketType::Unsubscribe),
        &body,
    )
}
