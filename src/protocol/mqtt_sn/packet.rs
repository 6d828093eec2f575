use crate::packet::{Packet, PacketError};
use crate::protocol::mqtt::codec::{DecodeError, Reader, Writer};

/// MQTT-SN 1.2 message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Advertise = 0x00,
    SearchGw = 0x01,
    GwInfo = 0x02,
    Connect = 0x04,
    ConnAck = 0x05,
    WillTopicReq = 0x06,
    WillTopic = 0x07,
    WillMsgReq = 0x08,
    WillMsg = 0x09,
    Register = 0x0A,
    RegAck = 0x0B,
    Publish = 0x0C,
    PubAck = 0x0D,
    PubComp = 0x0E,
    PubRec = 0x0F,
    PubRel = 0x10,
    Subscribe = 0x12,
    SubAck = 0x13,
    Unsubscribe = 0x14,
    UnsubAck = 0x15,
    PingReq = 0x16,
    PingResp = 0x17,
    Disconnect = 0x18,
    WillTopicUpd = 0x1A,
    WillTopicResp = 0x1B,
    WillMsgUpd = 0x1C,
    WillMsgResp = 0x1D,
    Reserved = 0xFF,
}

impl MsgType {
    pub fn from_u8(val: u8) -> MsgType {
        match val {
            0x00 => MsgType::Advertise,
            0x01 => MsgType::SearchGw,
            0x02 => MsgType::GwInfo,
            0x04 => MsgType::Connect,
            0x05 => MsgType::ConnAck,
            0x06 => MsgType::WillTopicReq,
            0x07 => MsgType::WillTopic,
            0x08 => MsgType::WillMsgReq,
            0x09 => MsgType::WillMsg,
            0x0A => MsgType::Register,
            0x0B => MsgType::RegAck,
            0x0C => MsgType::Publish,
            0x0D => MsgType::PubAck,
            0x0E => MsgType::PubComp,
            0x0F => MsgType::PubRec,
            0x10 => MsgType::PubRel,
            0x12 => MsgType::Subscribe,
            0x13 => MsgType::SubAck,
            0x14 => MsgType::Unsubscribe,
            0x15 => MsgType::UnsubAck,
            0x16 => MsgType::PingReq,
            0x17 => MsgType::PingResp,
            0x18 => MsgType::Disconnect,
            0x1A => MsgType::WillTopicUpd,
            0x1B => MsgType::WillTopicResp,
            0x1C => MsgType::WillMsgUpd,
            0x1D => MsgType::WillMsgResp,
            _ => MsgType::Reserved,
        }
    }
}

/// Return codes carried by CONNACK, REGACK, PUBACK and SUBACK.
pub mod return_code {
    pub const ACCEPTED: u8 = 0x00;
    pub const CONGESTION: u8 = 0x01;
    pub const INVALID_TOPIC_ID: u8 = 0x02;
    pub const NOT_SUPPORTED: u8 = 0x03;
}

pub const PROTOCOL_ID: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TopicIdType {
    #[default]
    Normal,
    Predefined,
    ShortName,
    Reserved,
}

impl TopicIdType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => TopicIdType::Normal,
            1 => TopicIdType::Predefined,
            2 => TopicIdType::ShortName,
            _ => TopicIdType::Reserved,
        }
    }
    fn bits(self) -> u8 {
        match self {
            TopicIdType::Normal => 0,
            TopicIdType::Predefined => 1,
            TopicIdType::ShortName => 2,
            TopicIdType::Reserved => 3,
        }
    }
}

/// The flags octet. `qos` holds the raw two bits; 3 is QoS -1, publish without connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl Flags {
    pub fn from_u8(val: u8) -> Self {
        Flags {
            dup: val & 0x80 != 0,
            qos: (val >> 5) & 0x03,
            retain: val & 0x10 != 0,
            will: val & 0x08 != 0,
            clean_session: val & 0x04 != 0,
            topic_id_type: TopicIdType::from_bits(val),
        }
    }
    pub fn to_u8(self) -> u8 {
        (self.dup as u8) << 7
            | (self.qos & 0x03) << 5
            | (self.retain as u8) << 4
            | (self.will as u8) << 3
            | (self.clean_session as u8) << 2
            | self.topic_id_type.bits()
    }
    pub fn with_qos(qos: u8, topic_id_type: TopicIdType) -> Self {
        Flags {
            qos,
            topic_id_type,
            ..Flags::default()
        }
    }
    pub fn is_qos_minus_one(&self) -> bool {
        self.qos == 3
    }
    /// QoS for the session layer; -1 behaves as 0.
    pub fn qos_level(&self) -> u8 {
        if self.is_qos_minus_one() {
            0
        } else {
            self.qos
        }
    }
}

/// Topic as carried in SUBSCRIBE and UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRef {
    Name(String),
    Predefined(u16),
    Short([u8; 2]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnPacket {
    Advertise { gateway_id: u8, duration: u16 },
    SearchGw { radius: u8 },
    GwInfo { gateway_id: u8 },
    Connect { flags: Flags, protocol_id: u8, duration: u16, client_id: String },
    ConnAck { code: u8 },
    Register { topic_id: u16, msg_id: u16, topic_name: String },
    RegAck { topic_id: u16, msg_id: u16, code: u8 },
    Publish { flags: Flags, topic_id: u16, msg_id: u16, data: Vec<u8> },
    PubAck { topic_id: u16, msg_id: u16, code: u8 },
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe { flags: Flags, msg_id: u16, topic: TopicRef },
    SubAck { flags: Flags, topic_id: u16, msg_id: u16, code: u8 },
    Unsubscribe { flags: Flags, msg_id: u16, topic: TopicRef },
    UnsubAck(u16),
    PingReq { client_id: Option<String> },
    PingResp,
    Disconnect { duration: Option<u16> },
    /// Will handling and other messages decoded only by type.
    Other(MsgType),
}

impl SnPacket {
    pub fn msg_type(&self) -> MsgType {
        match self {
            SnPacket::Advertise { .. } => MsgType::Advertise,
            SnPacket::SearchGw { .. } => MsgType::SearchGw,
            SnPacket::GwInfo { .. } => MsgType::GwInfo,
            SnPacket::Connect { .. } => MsgType::Connect,
            SnPacket::ConnAck { .. } => MsgType::ConnAck,
            SnPacket::Register { .. } => MsgType::Register,
            SnPacket::RegAck { .. } => MsgType::RegAck,
            SnPacket::Publish { .. } => MsgType::Publish,
            SnPacket::PubAck { .. } => MsgType::PubAck,
            SnPacket::PubRec(_) => MsgType::PubRec,
            SnPacket::PubRel(_) => MsgType::PubRel,
            SnPacket::PubComp(_) => MsgType::PubComp,
            SnPacket::Subscribe { .. } => MsgType::Subscribe,
            SnPacket::SubAck { .. } => MsgType::SubAck,
            SnPacket::Unsubscribe { .. } => MsgType::Unsubscribe,
            SnPacket::UnsubAck(_) => MsgType::UnsubAck,
            SnPacket::PingReq { .. } => MsgType::PingReq,
            SnPacket::PingResp => MsgType::PingResp,
            SnPacket::Disconnect { .. } => MsgType::Disconnect,
            SnPacket::Other(msg_type) => *msg_type,
        }
    }

    /// Decode one message at the packet's position. The length octet counts the whole message;
    /// `0x01` announces a three octet length.
    pub fn decode(packet: &mut Packet) -> Result<SnPacket, DecodeError> {
        let bytes = packet.remaining_slice();
        let first = *bytes.first().ok_or(DecodeError::EndOfBuffer)?;
        let (length, header_len) = if first == 0x01 {
            if bytes.len() < 3 {
                return Err(DecodeError::EndOfBuffer);
            }
            (u16::from_be_bytes([bytes[1], bytes[2]]) as usize, 3)
        } else {
            (first as usize, 1)
        };
        if length < header_len + 1 {
            return Err(DecodeError::malformed(format!("length {} too short", length)));
        }
        if length > bytes.len() {
            return Err(DecodeError::EndOfBuffer);
        }
        let msg_type = MsgType::from_u8(bytes[header_len]);
        let body = &bytes[header_len + 1..length];
        let decoded = Self::decode_body(msg_type, body)?;
        packet
            .advance(length)
            .map_err(|_| DecodeError::EndOfBuffer)?;
        Ok(decoded)
    }

    fn decode_body(msg_type: MsgType, body: &[u8]) -> Result<SnPacket, DecodeError> {
        let mut reader = Reader::new(body);
        let decoded = match msg_type {
            MsgType::Advertise => SnPacket::Advertise {
                gateway_id: reader.read_u8()?,
                duration: reader.read_u16()?,
            },
            MsgType::SearchGw => SnPacket::SearchGw {
                radius: reader.read_u8()?,
            },
            MsgType::GwInfo => {
                let gateway_id = reader.read_u8()?;
                reader.read_rest();
                SnPacket::GwInfo { gateway_id }
            }
            MsgType::Connect => SnPacket::Connect {
                flags: Flags::from_u8(reader.read_u8()?),
                protocol_id: reader.read_u8()?,
                duration: reader.read_u16()?,
                client_id: utf8(reader.read_rest())?,
            },
            MsgType::ConnAck => SnPacket::ConnAck {
                code: reader.read_u8()?,
            },
            MsgType::Register => SnPacket::Register {
                topic_id: reader.read_u16()?,
                msg_id: reader.read_u16()?,
                topic_name: utf8(reader.read_rest())?,
            },
            MsgType::RegAck => SnPacket::RegAck {
                topic_id: reader.read_u16()?,
                msg_id: reader.read_u16()?,
                code: reader.read_u8()?,
            },
            MsgType::Publish => SnPacket::Publish {
                flags: Flags::from_u8(reader.read_u8()?),
                topic_id: reader.read_u16()?,
                msg_id: reader.read_u16()?,
                data: reader.read_rest().to_vec(),
            },
            MsgType::PubAck => SnPacket::PubAck {
                topic_id: reader.read_u16()?,
                msg_id: reader.read_u16()?,
                code: reader.read_u8()?,
            },
            MsgType::PubRec => SnPacket::PubRec(reader.read_u16()?),
            MsgType::PubRel => SnPacket::PubRel(reader.read_u16()?),
            MsgType::PubComp => SnPacket::PubComp(reader.read_u16()?),
            MsgType::Subscribe | MsgType::Unsubscribe => {
                let flags = Flags::from_u8(reader.read_u8()?);
                let msg_id = reader.read_u16()?;
                let topic = match flags.topic_id_type {
                    TopicIdType::Normal => TopicRef::Name(utf8(reader.read_rest())?),
                    TopicIdType::Predefined => TopicRef::Predefined(reader.read_u16()?),
                    TopicIdType::ShortName => {
                        let b = reader.read_bytes(2)?;
                        TopicRef::Short([b[0], b[1]])
                    }
                    TopicIdType::Reserved => {
                        return Err(DecodeError::malformed("reserved topic id type"))
                    }
                };
                if msg_type == MsgType::Subscribe {
                    SnPacket::Subscribe { flags, msg_id, topic }
                } else {
                    SnPacket::Unsubscribe { flags, msg_id, topic }
                }
            }
            MsgType::SubAck => SnPacket::SubAck {
                flags: Flags::from_u8(reader.read_u8()?),
                topic_id: reader.read_u16()?,
                msg_id: reader.read_u16()?,
                code: reader.read_u8()?,
            },
            MsgType::UnsubAck => SnPacket::UnsubAck(reader.read_u16()?),
            MsgType::PingReq => {
                let rest = reader.read_rest();
                SnPacket::PingReq {
                    client_id: if rest.is_empty() { None } else { Some(utf8(rest)?) },
                }
            }
            MsgType::PingResp => SnPacket::PingResp,
            MsgType::Disconnect => SnPacket::Disconnect {
                duration: if reader.is_empty() {
                    None
                } else {
                    Some(reader.read_u16()?)
                },
            },
            MsgType::Reserved => return Err(DecodeError::malformed("reserved message type")),
            other => {
                reader.read_rest();
                SnPacket::Other(other)
            }
        };
        if !reader.is_empty() {
            return Err(DecodeError::malformed(format!(
                "{} trailing bytes after {:?}",
                reader.remaining(),
                msg_type
            )));
        }
        Ok(decoded)
    }

    /// Serialize the whole message, or nothing when it does not fit.
    pub fn encode(&self, packet: &mut Packet) -> Result<usize, PacketError> {
        let mut body = Writer::new();
        match self {
            SnPacket::Advertise {
                gateway_id,
                duration,
            } => {
                body.u8(*gateway_id).u16(*duration);
            }
            SnPacket::SearchGw { radius } => {
                body.u8(*radius);
            }
            SnPacket::GwInfo { gateway_id } => {
                body.u8(*gateway_id);
            }
            SnPacket::Connect {
                flags,
                protocol_id,
                duration,
                client_id,
            } => {
                body.u8(flags.to_u8())
                    .u8(*protocol_id)
                    .u16(*duration)
                    .bytes(client_id.as_bytes());
            }
            SnPacket::ConnAck { code } => {
                body.u8(*code);
            }
            SnPacket::Register {
                topic_id,
                msg_id,
                topic_name,
            } => {
                body.u16(*topic_id).u16(*msg_id).bytes(topic_name.as_bytes());
            }
            SnPacket::RegAck {
                topic_id,
                msg_id,
                code,
            }
            | SnPacket::PubAck {
                topic_id,
                msg_id,
                code,
            } => {
                body.u16(*topic_id).u16(*msg_id).u8(*code);
            }
            SnPacket::Publish {
                flags,
                topic_id,
                msg_id,
                data,
            } => {
                body.u8(flags.to_u8()).u16(*topic_id).u16(*msg_id).bytes(data);
            }
            SnPacket::PubRec(msg_id)
            | SnPacket::PubRel(msg_id)
            | SnPacket::PubComp(msg_id)
            | SnPacket::UnsubAck(msg_id) => {
                body.u16(*msg_id);
            }
            SnPacket::Subscribe {
                flags,
                msg_id,
                topic,
            }
            | SnPacket::Unsubscribe {
                flags,
                msg_id,
                topic,
            } => {
                body.u8(flags.to_u8()).u16(*msg_id);
                match topic {
                    TopicRef::Name(name) => body.bytes(name.as_bytes()),
                    TopicRef::Predefined(id) => body.u16(*id),
                    TopicRef::Short(short) => body.bytes(short),
                };
            }
            SnPacket::SubAck {
                flags,
                topic_id,
                msg_id,
                code,
            } => {
                body.u8(flags.to_u8()).u16(*topic_id).u16(*msg_id).u8(*code);
            }
            SnPacket::PingReq { client_id } => {
                if let Some(client_id) = client_id {
                    body.bytes(client_id.as_bytes());
                }
            }
            SnPacket::PingResp | SnPacket::Other(_) => {}
            SnPacket::Disconnect { duration } => {
                if let Some(duration) = duration {
                    body.u16(*duration);
                }
            }
        }
        let body = body.as_slice();
        let short = body.len() + 2 <= 0xFF;
        let total = if short { body.len() + 2 } else { body.len() + 4 };
        if total > u16::MAX as usize || total > packet.remaining() {
            return Err(PacketError::Overflow);
        }
        if short {
            packet.put_u8(total as u8)?;
        } else {
            packet.put_u8(0x01)?;
            packet.put_u16(total as u16)?;
        }
        packet.put_u8(self.msg_type() as u8)?;
        packet.put_slice(body)?;
        Ok(total)
    }
}

fn utf8(bytes: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::malformed("text is not valid UTF-8"))
}
