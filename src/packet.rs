use crate::error::MqttError;
use crate::wire;
use bytes::Bytes;

// MQTT control packet type bytes, including the mandatory reserved flag
// bits for PUBREL, SUBSCRIBE and UNSUBSCRIBE.
pub const MQTT_CONNECT: u8 = 0x10;
pub const MQTT_CONNACK: u8 = 0x20;
pub const MQTT_PUBLISH: u8 = 0x30;
pub const MQTT_PUBACK: u8 = 0x40;
pub const MQTT_PUBREC: u8 = 0x50;
pub const MQTT_PUBREL: u8 = 0x62;
pub const MQTT_PUBCOMP: u8 = 0x70;
pub const MQTT_SUBSCRIBE: u8 = 0x82;
pub const MQTT_SUBACK: u8 = 0x90;
pub const MQTT_UNSUBSCRIBE: u8 = 0xA2;
pub const MQTT_UNSUBACK: u8 = 0xB0;
pub const MQTT_PINGREQ: u8 = 0xC0;
pub const MQTT_PINGRESP: u8 = 0xD0;
pub const MQTT_DISCONNECT: u8 = 0xE0;

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 0x04;

/// CONNACK status code for an accepted connection. Codes 1 through 5 are
/// the rejection reasons defined by the protocol.
pub const CONNECTION_ACCEPTED: u8 = 0x00;

/// A message the broker publishes on the client's behalf after an
/// ungraceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: String,
    pub qos: u8,
    pub retain: bool,
}

/// One discrete MQTT control packet. Each variant carries only the fields
/// relevant to that packet type; packets without a packet identifier
/// (Connect, QoS 0 Publish, Ping*, Disconnect) never hold one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Connect {
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        clean_session: bool,
        will: Option<Will>,
        keep_alive: u16,
    },
    ConnectAck {
        session_present: bool,
        status_code: u8,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
        dup: bool,
        retain: bool,
        packet_id: Option<u16>,
    },
    PublishAck { packet_id: u16 },
    PublishReceived { packet_id: u16 },
    PublishRelease { packet_id: u16 },
    PublishComplete { packet_id: u16 },
    Subscribe {
        packet_id: u16,
        topic: String,
        qos: u8,
    },
    SubscribeAck {
        packet_id: u16,
        granted_qos: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        topic: String,
    },
    UnsubscribeAck { packet_id: u16 },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl ControlPacket {
    /// The fixed-header byte. For Publish the low nibble is computed from
    /// the dup/qos/retain flags; everything else is a constant.
    pub fn packet_type_byte(&self) -> u8 {
        match self {
            ControlPacket::Connect { .. } => MQTT_CONNECT,
            ControlPacket::ConnectAck { .. } => MQTT_CONNACK,
            ControlPacket::Publish { dup, qos, retain, .. } => {
                MQTT_PUBLISH | ((*dup as u8) << 3) | (qos << 1) | (*retain as u8)
            }
            ControlPacket::PublishAck { .. } => MQTT_PUBACK,
            ControlPacket::PublishReceived { .. } => MQTT_PUBREC,
            ControlPacket::PublishRelease { .. } => MQTT_PUBREL,
            ControlPacket::PublishComplete { .. } => MQTT_PUBCOMP,
            ControlPacket::Subscribe { .. } => MQTT_SUBSCRIBE,
            ControlPacket::SubscribeAck { .. } => MQTT_SUBACK,
            ControlPacket::Unsubscribe { .. } => MQTT_UNSUBSCRIBE,
            ControlPacket::UnsubscribeAck { .. } => MQTT_UNSUBACK,
            ControlPacket::PingRequest => MQTT_PINGREQ,
            ControlPacket::PingResponse => MQTT_PINGRESP,
            ControlPacket::Disconnect => MQTT_DISCONNECT,
        }
    }

    /// The packet identifier, for the variants that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            ControlPacket::Publish { packet_id, .. } => *packet_id,
            ControlPacket::PublishAck { packet_id }
            | ControlPacket::PublishReceived { packet_id }
            | ControlPacket::PublishRelease { packet_id }
            | ControlPacket::PublishComplete { packet_id }
            | ControlPacket::Subscribe { packet_id, .. }
            | ControlPacket::SubscribeAck { packet_id, .. }
            | ControlPacket::Unsubscribe { packet_id, .. }
            | ControlPacket::UnsubscribeAck { packet_id } => Some(*packet_id),
            _ => None,
        }
    }

    /// Encodes the packet as `fixed header byte ++ remaining length ++
    /// variable header ++ payload`.
    pub fn encode(&self) -> Result<Bytes, MqttError> {
        let body = self.encode_body()?;
        let length = wire::encode_remaining_length(body.len())?;

        let mut out = Vec::with_capacity(1 + length.len() + body.len());
        out.push(self.packet_type_byte());
        out.extend_from_slice(&length);
        out.extend_from_slice(&body);
        Ok(Bytes::from(out))
    }

    fn encode_body(&self) -> Result<Vec<u8>, MqttError> {
        let mut body = Vec::new();
        match self {
            ControlPacket::Connect {
                client_id,
                username,
                password,
                clean_session,
                will,
                keep_alive,
            } => {
                wire::write_string(&mut body, PROTOCOL_NAME);
                body.push(PROTOCOL_LEVEL);

                let mut connect_flags = 0u8;
                if *clean_session {
                    connect_flags |= 0x02;
                }
                if let Some(will) = will {
                    connect_flags |= 0x04;
                    connect_flags |= (will.qos & 0x03) << 3;
                    if will.retain {
                        connect_flags |= 0x20;
                    }
                }
                if username.is_some() {
                    connect_flags |= 0x80;
                    // A password is only announced alongside a username.
                    if password.is_some() {
                        connect_flags |= 0x40;
                    }
                }
                body.push(connect_flags);
                body.push((keep_alive >> 8) as u8);
                body.push((keep_alive & 0xFF) as u8);

                wire::write_string(&mut body, client_id);
                if let Some(will) = will {
                    wire::write_string(&mut body, &will.topic);
                    wire::write_string(&mut body, &will.message);
                }
                if let Some(username) = username {
                    wire::write_string(&mut body, username);
                    if let Some(password) = password {
                        wire::write_string(&mut body, password);
                    }
                }
            }
            ControlPacket::ConnectAck {
                session_present,
                status_code,
            } => {
                body.push(*session_present as u8);
                body.push(*status_code);
            }
            ControlPacket::Publish {
                topic,
                payload,
                qos,
                packet_id,
                ..
            } => {
                wire::write_string(&mut body, topic);
                if *qos >= 1 {
                    let id = packet_id.ok_or_else(|| {
                        MqttError::Protocol("QoS >= 1 PUBLISH requires a packet id".to_string())
                    })?;
                    wire::write_packet_id(&mut body, id);
                }
                body.extend_from_slice(payload);
            }
            ControlPacket::PublishAck { packet_id }
            | ControlPacket::PublishReceived { packet_id }
            | ControlPacket::PublishRelease { packet_id }
            | ControlPacket::PublishComplete { packet_id }
            | ControlPacket::UnsubscribeAck { packet_id } => {
                wire::write_packet_id(&mut body, *packet_id);
            }
            ControlPacket::Subscribe {
                packet_id,
                topic,
                qos,
            } => {
                wire::write_packet_id(&mut body, *packet_id);
                wire::write_string(&mut body, topic);
                body.push(*qos);
            }
            ControlPacket::SubscribeAck {
                packet_id,
                granted_qos,
            } => {
                wire::write_packet_id(&mut body, *packet_id);
                body.extend_from_slice(granted_qos);
            }
            ControlPacket::Unsubscribe { packet_id, topic } => {
                wire::write_packet_id(&mut body, *packet_id);
                wire::write_string(&mut body, topic);
            }
            ControlPacket::PingRequest
            | ControlPacket::PingResponse
            | ControlPacket::Disconnect => {}
        }
        Ok(body)
    }

    /// Decodes one complete frame, dispatching on the first byte: the high
    /// nibble for PUBLISH, the full byte for everything else.
    pub fn decode(frame: &[u8]) -> Result<ControlPacket, MqttError> {
        let first_byte = *frame
            .first()
            .ok_or_else(|| MqttError::Malformed("empty frame".to_string()))?;
        let (remaining_length, length_bytes) = wire::decode_remaining_length(&frame[1..])?;
        let body_start = 1 + length_bytes;
        if frame.len() < body_start + remaining_length as usize {
            return Err(MqttError::Incomplete);
        }
        let data = &frame[body_start..body_start + remaining_length as usize];

        match first_byte {
            MQTT_CONNECT => decode_connect(data),
            MQTT_CONNACK => {
                if data.len() < 2 {
                    return Err(MqttError::Malformed("short CONNACK".to_string()));
                }
                Ok(ControlPacket::ConnectAck {
                    session_present: data[0] & 0x01 != 0,
                    status_code: data[1],
                })
            }
            b if b & 0xF0 == MQTT_PUBLISH => decode_publish(first_byte, data),
            MQTT_PUBACK => Ok(ControlPacket::PublishAck {
                packet_id: wire::parse_packet_id(data, &mut 0)?,
            }),
            MQTT_PUBREC => Ok(ControlPacket::PublishReceived {
                packet_id: wire::parse_packet_id(data, &mut 0)?,
            }),
            MQTT_PUBREL => Ok(ControlPacket::PublishRelease {
                packet_id: wire::parse_packet_id(data, &mut 0)?,
            }),
            MQTT_PUBCOMP => Ok(ControlPacket::PublishComplete {
                packet_id: wire::parse_packet_id(data, &mut 0)?,
            }),
            MQTT_SUBSCRIBE => {
                let mut offset = 0;
                let packet_id = wire::parse_packet_id(data, &mut offset)?;
                let topic = wire::parse_string(data, &mut offset)?;
                let qos = *data
                    .get(offset)
                    .ok_or_else(|| MqttError::Malformed("missing QoS in SUBSCRIBE".to_string()))?;
                Ok(ControlPacket::Subscribe {
                    packet_id,
                    topic,
                    qos,
                })
            }
            MQTT_SUBACK => {
                let mut offset = 0;
                let packet_id = wire::parse_packet_id(data, &mut offset)?;
                Ok(ControlPacket::SubscribeAck {
                    packet_id,
                    granted_qos: data[offset..].to_vec(),
                })
            }
            MQTT_UNSUBSCRIBE => {
                let mut offset = 0;
                let packet_id = wire::parse_packet_id(data, &mut offset)?;
                let topic = wire::parse_string(data, &mut offset)?;
                Ok(ControlPacket::Unsubscribe { packet_id, topic })
            }
            MQTT_UNSUBACK => Ok(ControlPacket::UnsubscribeAck {
                packet_id: wire::parse_packet_id(data, &mut 0)?,
            }),
            MQTT_PINGREQ => Ok(ControlPacket::PingRequest),
            MQTT_PINGRESP => Ok(ControlPacket::PingResponse),
            MQTT_DISCONNECT => Ok(ControlPacket::Disconnect),
            _ => Err(MqttError::Protocol(format!(
                "unexpected packet type byte 0x{:02X}",
                first_byte
            ))),
        }
    }
}

fn decode_connect(data: &[u8]) -> Result<ControlPacket, MqttError> {
    let mut offset = 0;
    let protocol_name = wire::parse_string(data, &mut offset)?;
    if protocol_name != PROTOCOL_NAME || data.get(offset).copied() != Some(PROTOCOL_LEVEL) {
        return Err(MqttError::Protocol(format!(
            "unsupported protocol '{}' or level",
            protocol_name
        )));
    }
    offset += 1;

    let connect_flags = *data
        .get(offset)
        .ok_or_else(|| MqttError::Malformed("missing connect flags".to_string()))?;
    let clean_session = connect_flags & 0x02 != 0;
    let will_flag = connect_flags & 0x04 != 0;
    let username_flag = connect_flags & 0x80 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    offset += 1;

    let keep_alive = wire::parse_packet_id(data, &mut offset)?;
    let client_id = wire::parse_string(data, &mut offset)?;

    let will = if will_flag {
        let topic = wire::parse_string(data, &mut offset)?;
        let message = wire::parse_string(data, &mut offset)?;
        Some(Will {
            topic,
            message,
            qos: (connect_flags >> 3) & 0x03,
            retain: connect_flags & 0x20 != 0,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(wire::parse_string(data, &mut offset)?)
    } else {
        None
    };
    let password = if password_flag {
        Some(wire::parse_string(data, &mut offset)?)
    } else {
        None
    };

    Ok(ControlPacket::Connect {
        client_id,
        username,
        password,
        clean_session,
        will,
        keep_alive,
    })
}

fn decode_publish(first_byte: u8, data: &[u8]) -> Result<ControlPacket, MqttError> {
    let dup = first_byte & 0x08 != 0;
    let qos = (first_byte >> 1) & 0x03;
    let retain = first_byte & 0x01 != 0;
    if qos > 2 {
        return Err(MqttError::Protocol("invalid PUBLISH QoS 3".to_string()));
    }

    let mut offset = 0;
    let topic = wire::parse_string(data, &mut offset)?;
    // No packet id at QoS 0: the whole remainder is application payload.
    let packet_id = if qos >= 1 {
        Some(wire::parse_packet_id(data, &mut offset)?)
    } else {
        None
    };
    let payload = Bytes::from(data[offset..].to_vec());

    Ok(ControlPacket::Publish {
        topic,
        payload,
        qos,
        dup,
        retain,
        packet_id,
    })
}
