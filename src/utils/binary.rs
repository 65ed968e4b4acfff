//! Bit and byte helpers used by the packet codec.
//!
//! Bit indexes passed to [`is_set`], [`set_bit`] and [`clear_bit`] count from
//! the least significant bit (0..=7). [`extract_bits_from`] instead uses the
//! 1-based position counted from the most significant bit, which is how the
//! MQTT 3.1.1 standard numbers header flags.

use bytes::{BufMut, BytesMut};

use crate::utils::error::{MqttError, Result};

/// Largest string a length-prefixed field can carry.
pub const MAX_STRING_LENGTH: usize = u16::MAX as usize;

fn check_bit_index(bit: u8) -> Result<()> {
    if bit > 7 {
        return Err(MqttError::OutOfRange(format!(
            "bit index {bit} is outside 0..=7"
        )));
    }
    Ok(())
}

pub fn is_set(byte: u8, bit: u8) -> Result<bool> {
    check_bit_index(bit)?;
    Ok(byte & (1 << bit) != 0)
}

pub fn set_bit(byte: u8, bit: u8) -> Result<u8> {
    check_bit_index(bit)?;
    Ok(byte | (1 << bit))
}

pub fn clear_bit(byte: u8, bit: u8) -> Result<u8> {
    check_bit_index(bit)?;
    Ok(byte & !(1 << bit))
}

/// Returns the top `count` bits of `byte`, right aligned.
pub fn extract_bits(byte: u8, count: u8) -> Result<u8> {
    if count == 0 || count > 8 {
        return Err(MqttError::OutOfRange(format!(
            "bit count {count} is outside 1..=8"
        )));
    }
    Ok(byte >> (8 - count))
}

/// Returns `count` bits starting at the 1-based position `start`, counted from
/// the most significant bit, right aligned.
pub fn extract_bits_from(byte: u8, start: u8, count: u8) -> Result<u8> {
    if !(1..=8).contains(&start) {
        return Err(MqttError::OutOfRange(format!(
            "bit position {start} is outside 1..=8"
        )));
    }
    extract_bits(byte << (start - 1), count)
}

/// Decodes a big-endian `u16` at `index`.
pub fn read_u16(bytes: &[u8], index: usize) -> Result<u16> {
    match bytes.get(index..index + 2) {
        Some(pair) => Ok(u16::from_be_bytes([pair[0], pair[1]])),
        None => Err(MqttError::MalformedPacket(format!(
            "expected two bytes at index {index}, packet has {}",
            bytes.len()
        ))),
    }
}

/// Decodes a length-prefixed UTF-8 string starting at `index`.
pub fn read_string(bytes: &[u8], index: usize) -> Result<String> {
    read_string_at(bytes, index).map(|(value, _)| value)
}

/// Like [`read_string`] but also returns the index right after the string.
pub fn read_string_at(bytes: &[u8], index: usize) -> Result<(String, usize)> {
    let length = read_u16(bytes, index)? as usize;
    let start = index + 2;
    let end = start + length;
    let raw = bytes.get(start..end).ok_or_else(|| {
        MqttError::MalformedPacket(format!(
            "string of length {length} at index {index} overruns packet of {} bytes",
            bytes.len()
        ))
    })?;
    let value = std::str::from_utf8(raw).map_err(|e| {
        MqttError::MalformedPacket(format!("string at index {index} is not UTF-8: {e}"))
    })?;
    Ok((value.to_string(), end))
}

pub fn write_u16(buf: &mut BytesMut, value: u16) {
    buf.put_u16(value);
}

/// Appends `value` with its two byte big-endian length prefix.
pub fn write_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    if value.len() > MAX_STRING_LENGTH {
        return Err(MqttError::ProtocolViolation(format!(
            "string of {} bytes exceeds the {MAX_STRING_LENGTH} byte limit",
            value.len()
        )));
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}
