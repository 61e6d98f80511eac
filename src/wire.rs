use crate::error::MqttError;

/// Largest value representable by the 4-byte remaining-length encoding.
pub const MAX_REMAINING_LENGTH: usize = 128 * 128 * 128 * 128;

/// Encodes a remaining length as the MQTT variable-length integer: 7 data
/// bits per byte, high bit set while more bytes follow, 1 to 4 bytes total.
pub fn encode_remaining_length(mut len: usize) -> Result<Vec<u8>, MqttError> {
    if len >= MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge(format!(
            "remaining length {} exceeds the 4-byte encoding",
            len
        )));
    }

    let mut output = Vec::with_capacity(4);
    loop {
        let mut byte = (len & 0x7F) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        output.push(byte);
        if len == 0 {
            break;
        }
    }
    Ok(output)
}

/// Decodes a remaining-length integer from the front of `data`, returning
/// the value and the number of bytes consumed. `MqttError::Incomplete` means
/// the caller must wait for more bytes; a continuation bit on the 4th byte
/// is malformed and cannot be recovered.
pub fn decode_remaining_length(data: &[u8]) -> Result<(u32, usize), MqttError> {
    let mut remaining_length = 0u32;
    let mut multiplier = 1u32;

    for i in 0..4 {
        let byte = match data.get(i) {
            Some(b) => *b,
            None => return Err(MqttError::Incomplete),
        };
        remaining_length += ((byte & 0x7F) as u32) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((remaining_length, i + 1));
        }
        if i == 3 {
            return Err(MqttError::Malformed("invalid remaining length".to_string()));
        }
        multiplier *= 128;
    }

    unreachable!()
}

/// Appends a length-prefixed UTF-8 string: 2-byte big-endian length, then
/// the raw bytes. Lengths above 65535 are outside the protocol's limit.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_prefixed_bytes(buf, s.as_bytes());
}

pub fn write_prefixed_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push((data.len() >> 8) as u8);
    buf.push((data.len() & 0xFF) as u8);
    buf.extend_from_slice(data);
}

/// Parses a length-prefixed UTF-8 string at `*offset`, advancing the offset
/// past the prefix and the string bytes.
pub fn parse_string(data: &[u8], offset: &mut usize) -> Result<String, MqttError> {
    if *offset + 2 > data.len() {
        return Err(MqttError::Malformed("invalid string length".to_string()));
    }
    let len = ((data[*offset] as usize) << 8) | (data[*offset + 1] as usize);
    *offset += 2;
    if *offset + len > data.len() {
        return Err(MqttError::Malformed("invalid string data".to_string()));
    }
    let s = String::from_utf8(data[*offset..*offset + len].to_vec())
        .map_err(|_| MqttError::Malformed("invalid UTF-8 string".to_string()))?;
    *offset += len;
    Ok(s)
}

pub fn write_packet_id(buf: &mut Vec<u8>, packet_id: u16) {
    buf.push((packet_id >> 8) as u8);
    buf.push((packet_id & 0xFF) as u8);
}

pub fn parse_packet_id(data: &[u8], offset: &mut usize) -> Result<u16, MqttError> {
    if *offset + 2 > data.len() {
        return Err(MqttError::Malformed("missing packet id".to_string()));
    }
    let id = ((data[*offset] as u16) << 8) | (data[*offset + 1] as u16);
    *offset += 2;
    Ok(id)
}
