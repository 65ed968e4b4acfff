use bytes::{BufMut, BytesMut};

use super::{PROTOCOL_LEVEL, PROTOCOL_NAME, ensure_consumed, frame};
use crate::packet::{Connect, ConnectAck, ConnectReturnCode, PacketType, QoS, Will};
use crate::topic::TopicEvaluator;
use crate::utils::binary::{
    extract_bits_from, is_set, read_string_at, read_u16, write_string, write_u16,
};
use crate::utils::error::{MqttError, Result};

const CLEAN_SESSION: u8 = 1;
const WILL_FLAG: u8 = 2;
const WILL_RETAIN: u8 = 5;
const PASSWORD_FLAG: u8 = 6;
const USERNAME_FLAG: u8 = 7;

/// Client identifiers must be empty or made of ASCII letters and digits only.
pub(crate) fn validate_client_id(
    client_id: &str,
    clean_session: bool,
    max_length: usize,
) -> Result<()> {
    if client_id.len() > max_length {
        return Err(MqttError::ConnectionRefused(
            ConnectReturnCode::IdentifierRejected,
        ));
    }
    if client_id.is_empty() {
        if !clean_session {
            return Err(MqttError::ConnectionRefused(
                ConnectReturnCode::IdentifierRejected,
            ));
        }
        return Ok(());
    }
    if !client_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MqttError::ConnectionRefused(
            ConnectReturnCode::IdentifierRejected,
        ));
    }
    Ok(())
}

/// A will is published like any other message, so its topic follows the
/// topic name rules.
fn check_will_topic(topic: &str, topics: &dyn TopicEvaluator) -> Result<()> {
    if !topics.is_valid_topic_name(topic) {
        return Err(MqttError::ProtocolViolation(format!(
            "{topic:?} is not a valid will topic"
        )));
    }
    Ok(())
}

fn read_binary_at(bytes: &[u8], index: usize) -> Result<(Vec<u8>, usize)> {
    let length = read_u16(bytes, index)? as usize;
    let start = index + 2;
    let data = bytes.get(start..start + length).ok_or_else(|| {
        MqttError::MalformedPacket(format!(
            "binary field of {length} bytes at index {index} overruns the packet"
        ))
    })?;
    Ok((data.to_vec(), start + length))
}

pub(super) fn decode_connect(
    body: &[u8],
    client_id_max_length: usize,
    topics: &dyn TopicEvaluator,
) -> Result<Connect> {
    let (protocol_name, mut index) = read_string_at(body, 0)?;
    if protocol_name != PROTOCOL_NAME {
        return Err(MqttError::ProtocolViolation(format!(
            "unknown protocol name {protocol_name:?}"
        )));
    }

    let level = *body
        .get(index)
        .ok_or_else(|| MqttError::MalformedPacket("CONNECT without protocol level".to_string()))?;
    if level < PROTOCOL_LEVEL {
        return Err(MqttError::ConnectionRefused(
            ConnectReturnCode::UnacceptableProtocolVersion,
        ));
    }

    let flags = *body
        .get(index + 1)
        .ok_or_else(|| MqttError::MalformedPacket("CONNECT without flags".to_string()))?;
    index += 2;

    if is_set(flags, 0)? {
        return Err(MqttError::ProtocolViolation(
            "reserved CONNECT flag must be zero".to_string(),
        ));
    }
    let will_qos = extract_bits_from(flags, 4, 2)?;
    if will_qos == 3 {
        return Err(MqttError::ProtocolViolation(
            "will QoS 3 is not a valid level".to_string(),
        ));
    }
    let has_will = is_set(flags, WILL_FLAG)?;
    let will_retain = is_set(flags, WILL_RETAIN)?;
    if !has_will && (will_retain || will_qos != 0) {
        return Err(MqttError::ProtocolViolation(
            "will QoS and retain require the will flag".to_string(),
        ));
    }
    let has_username = is_set(flags, USERNAME_FLAG)?;
    let has_password = is_set(flags, PASSWORD_FLAG)?;
    if has_password && !has_username {
        return Err(MqttError::ProtocolViolation(
            "password flag requires the username flag".to_string(),
        ));
    }
    let clean_session = is_set(flags, CLEAN_SESSION)?;

    let keep_alive = read_u16(body, index)?;
    index += 2;

    let (client_id, next) = read_string_at(body, index)?;
    index = next;
    validate_client_id(&client_id, clean_session, client_id_max_length)?;

    let will = if has_will {
        let (topic, next) = read_string_at(body, index)?;
        check_will_topic(&topic, topics)?;
        let (payload, next) = read_binary_at(body, next)?;
        index = next;
        Some(Will {
            topic,
            qos: QoS::try_from(will_qos)?,
            retain: will_retain,
            payload,
        })
    } else {
        None
    };

    let username = if has_username {
        let (username, next) = read_string_at(body, index)?;
        index = next;
        Some(username)
    } else {
        None
    };
    let password = if has_password {
        let (password, next) = read_string_at(body, index)?;
        index = next;
        Some(password)
    } else {
        None
    };
    ensure_consumed(PacketType::Connect, body, index)?;

    Ok(Connect {
        client_id,
        clean_session,
        keep_alive,
        will,
        username,
        password,
    })
}

pub(super) fn encode_connect(
    connect: &Connect,
    client_id_max_length: usize,
    topics: &dyn TopicEvaluator,
) -> Result<Vec<u8>> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(MqttError::ProtocolViolation(
            "password requires a username".to_string(),
        ));
    }
    validate_client_id(
        &connect.client_id,
        connect.clean_session,
        client_id_max_length,
    )?;
    if let Some(will) = &connect.will {
        check_will_topic(&will.topic, topics)?;
    }

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 1 << CLEAN_SESSION;
    }
    if let Some(will) = &connect.will {
        flags |= 1 << WILL_FLAG;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 1 << WILL_RETAIN;
        }
    }
    if connect.username.is_some() {
        flags |= 1 << USERNAME_FLAG;
    }
    if connect.password.is_some() {
        flags |= 1 << PASSWORD_FLAG;
    }

    let mut body = BytesMut::new();
    write_string(&mut body, PROTOCOL_NAME)?;
    body.put_u8(PROTOCOL_LEVEL);
    body.put_u8(flags);
    write_u16(&mut body, connect.keep_alive);
    write_string(&mut body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        write_string(&mut body, &will.topic)?;
        if will.payload.len() > u16::MAX as usize {
            return Err(MqttError::ProtocolViolation(format!(
                "will payload of {} bytes does not fit a length prefix",
                will.payload.len()
            )));
        }
        write_u16(&mut body, will.payload.len() as u16);
        body.put_slice(&will.payload);
    }
    if let Some(username) = &connect.username {
        write_string(&mut body, username)?;
    }
    if let Some(password) = &connect.password {
        write_string(&mut body, password)?;
    }

    frame(PacketType::Connect, 0, &body)
}

pub(super) fn decode_connect_ack(body: &[u8]) -> Result<ConnectAck> {
    if body.len() != 2 {
        return Err(MqttError::MalformedPacket(format!(
            "CONNACK body must be 2 bytes, got {}",
            body.len()
        )));
    }
    if body[0] & 0xFE != 0 {
        return Err(MqttError::MalformedPacket(
            "reserved CONNACK acknowledge flags must be zero".to_string(),
        ));
    }
    let session_present = is_set(body[0], 0)?;
    let return_code = ConnectReturnCode::try_from(body[1])?;
    if session_present && return_code != ConnectReturnCode::Accepted {
        return Err(MqttError::MalformedPacket(format!(
            "session present must be zero when the connection is refused with {return_code:?}"
        )));
    }
    Ok(ConnectAck {
        return_code,
        session_present,
    })
}

pub(super) fn encode_connect_ack(ack: &ConnectAck) -> Result<Vec<u8>> {
    if ack.session_present && ack.return_code != ConnectReturnCode::Accepted {
        return Err(MqttError::MalformedPacket(format!(
            "session present cannot accompany {:?}",
            ack.return_code
        )));
    }
    let body = [ack.session_present as u8, ack.return_code as u8];
    frame(PacketType::ConnectAck, 0, &body)
}
