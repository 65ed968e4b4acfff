use bytes::{BufMut, BytesMut};

use super::frame;
use crate::packet::{PacketType, Publish, QoS};
use crate::topic::TopicEvaluator;
use crate::utils::binary::{extract_bits_from, is_set, read_string_at, read_u16, write_string, write_u16};
use crate::utils::error::{MqttError, Result};

const RETAIN: u8 = 0;
const DUPLICATE: u8 = 3;

fn check_publish(
    topic: &str,
    qos: QoS,
    duplicate: bool,
    packet_id: Option<u16>,
    topics: &dyn TopicEvaluator,
) -> Result<()> {
    if qos == QoS::AtMostOnce && duplicate {
        return Err(MqttError::ProtocolViolation(
            "duplicate flag is not allowed on QoS 0 PUBLISH".to_string(),
        ));
    }
    match (qos, packet_id) {
        (QoS::AtMostOnce, Some(id)) => {
            return Err(MqttError::ProtocolViolation(format!(
                "QoS 0 PUBLISH cannot carry packet id {id}"
            )));
        }
        (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
            return Err(MqttError::ProtocolViolation(format!(
                "{qos:?} PUBLISH requires a packet id"
            )));
        }
        (_, Some(0)) => {
            return Err(MqttError::ProtocolViolation(
                "packet id 0 is reserved".to_string(),
            ));
        }
        _ => {}
    }
    if !topics.is_valid_topic_name(topic) {
        return Err(MqttError::ProtocolViolation(format!(
            "{topic:?} is not a valid topic name"
        )));
    }
    Ok(())
}

pub(super) fn decode(flags: u8, body: &[u8], topics: &dyn TopicEvaluator) -> Result<Publish> {
    let qos_level = extract_bits_from(flags, 6, 2)?;
    if qos_level == 3 {
        return Err(MqttError::ProtocolViolation(
            "PUBLISH QoS bits must not both be set".to_string(),
        ));
    }
    let qos = QoS::try_from(qos_level)?;
    let duplicate = is_set(flags, DUPLICATE)?;
    let retain = is_set(flags, RETAIN)?;

    let (topic, mut index) = read_string_at(body, 0)?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        let id = read_u16(body, index)?;
        index += 2;
        Some(id)
    };
    check_publish(&topic, qos, duplicate, packet_id, topics)?;

    Ok(Publish {
        topic,
        qos,
        retain,
        duplicate,
        packet_id,
        payload: body[index..].to_vec(),
    })
}

pub(super) fn encode(publish: &Publish, topics: &dyn TopicEvaluator) -> Result<Vec<u8>> {
    check_publish(
        &publish.topic,
        publish.qos,
        publish.duplicate,
        publish.packet_id,
        topics,
    )?;

    let mut flags = (publish.qos as u8) << 1;
    if publish.duplicate {
        flags |= 1 << DUPLICATE;
    }
    if publish.retain {
        flags |= 1 << RETAIN;
    }

    let mut body = BytesMut::with_capacity(publish.topic.len() + publish.payload.len() + 4);
    write_string(&mut body, &publish.topic)?;
    if let Some(packet_id) = publish.packet_id {
        write_u16(&mut body, packet_id);
    }
    body.put_slice(&publish.payload);

    frame(PacketType::Publish, flags, &body)
}
