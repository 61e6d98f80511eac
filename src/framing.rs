use crate::error::MqttError;
use crate::packet::ControlPacket;
use crate::wire;
use bytes::{Buf, BytesMut};

/// Reassembles discrete MQTT frames from an arbitrarily-chunked byte
/// stream. One reader exclusively owns the buffer for its connection;
/// transport reads never align with packet boundaries, so unconsumed
/// trailing bytes stay buffered for the next call.
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader {
            buffer: BytesMut::new(),
        }
    }

    /// Appends one transport chunk to the accumulation buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extracts and decodes the next complete frame from the front of the
    /// buffer. `Ok(None)` means more bytes are needed; the partial frame
    /// stays buffered. A decode failure is fatal for the stream, since a
    /// malformed MQTT stream cannot be resynchronized.
    pub fn next_packet(&mut self) -> Result<Option<ControlPacket>, MqttError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let (remaining_length, length_bytes) = match wire::decode_remaining_length(&self.buffer[1..])
        {
            Ok(decoded) => decoded,
            Err(MqttError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };

        let frame_length = 1 + length_bytes + remaining_length as usize;
        if self.buffer.len() < frame_length {
            return Ok(None);
        }

        let frame = self.buffer.copy_to_bytes(frame_length);
        ControlPacket::decode(&frame).map(Some)
    }

    /// Bytes currently buffered and not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        FrameReader::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_publish(topic: &str, payload: &[u8]) -> ControlPacket {
        ControlPacket::Publish {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_vec()),
            qos: 0,
            dup: false,
            retain: false,
            packet_id: None,
        }
    }

    #[test]
    fn whole_frame_in_one_chunk() {
        let packet = sample_publish("foo/bar", b"hello");
        let mut reader = FrameReader::new();
        reader.push(&packet.encode().unwrap());

        assert_eq!(reader.next_packet().unwrap(), Some(packet));
        assert_eq!(reader.next_packet().unwrap(), None);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn one_byte_chunks_reassemble() {
        let packet = sample_publish("foo/bar", b"split me");
        let encoded = packet.encode().unwrap();

        let mut reader = FrameReader::new();
        for (i, byte) in encoded.iter().enumerate() {
            if i + 1 < encoded.len() {
                reader.push(&[*byte]);
                assert_eq!(reader.next_packet().unwrap(), None, "byte {}", i);
            } else {
                reader.push(&[*byte]);
            }
        }
        assert_eq!(reader.next_packet().unwrap(), Some(packet));
    }

    #[test]
    fn multiple_frames_in_one_chunk_arrive_in_order() {
        let packets = vec![
            sample_publish("a", b"1"),
            ControlPacket::PublishAck { packet_id: 3 },
            ControlPacket::PingResponse,
            sample_publish("b/c", b"22"),
        ];
        let mut chunk = Vec::new();
        for packet in &packets {
            chunk.extend_from_slice(&packet.encode().unwrap());
        }

        let mut reader = FrameReader::new();
        reader.push(&chunk);
        for expected in &packets {
            assert_eq!(reader.next_packet().unwrap().as_ref(), Some(expected));
        }
        assert_eq!(reader.next_packet().unwrap(), None);
    }

    #[test]
    fn split_multi_byte_remaining_length() {
        // 200-byte payload forces a 2-byte remaining length field.
        let packet = sample_publish("t", &[0x5A; 200]);
        let encoded = packet.encode().unwrap();
        assert!(encoded[1] & 0x80 != 0);

        let mut reader = FrameReader::new();
        reader.push(&encoded[..2]);
        assert_eq!(reader.next_packet().unwrap(), None);
        reader.push(&encoded[2..3]);
        assert_eq!(reader.next_packet().unwrap(), None);
        reader.push(&encoded[3..]);
        assert_eq!(reader.next_packet().unwrap(), Some(packet));
    }

    #[test]
    fn trailing_partial_frame_stays_buffered() {
        let first = ControlPacket::PublishAck { packet_id: 9 };
        let second = sample_publish("x", b"y");
        let mut chunk = first.encode().unwrap().to_vec();
        let second_encoded = second.encode().unwrap();
        chunk.extend_from_slice(&second_encoded[..3]);

        let mut reader = FrameReader::new();
        reader.push(&chunk);
        assert_eq!(reader.next_packet().unwrap(), Some(first));
        assert_eq!(reader.next_packet().unwrap(), None);

        reader.push(&second_encoded[3..]);
        assert_eq!(reader.next_packet().unwrap(), Some(second));
    }

    #[test]
    fn unknown_type_byte_is_fatal() {
        let mut reader = FrameReader::new();
        reader.push(&[0x00, 0x00]);
        assert!(matches!(
            reader.next_packet(),
            Err(MqttError::Protocol(_))
        ));
    }

    #[test]
    fn malformed_remaining_length_is_fatal() {
        let mut reader = FrameReader::new();
        reader.push(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(matches!(
            reader.next_packet(),
            Err(MqttError::Malformed(_))
        ));
    }
}
