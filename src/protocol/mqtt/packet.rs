use super::codec::{decode_fixed_header, put_frame, DecodeError, Reader, Writer};
use crate::packet::{Packet, PacketError};

/// MQTT control packet types, keyed by the high nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Reserved = 0,
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    pub fn from_opcode(opcode: u8) -> PacketType {
        match opcode & 0x0F {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            15 => PacketType::Auth,
            _ => PacketType::Reserved,
        }
    }
}

/// CONNACK return codes.
pub mod connack {
    pub const ACCEPTED: u8 = 0x00;
    pub const UNACCEPTABLE_PROTOCOL_VERSION: u8 = 0x01;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const SERVER_UNAVAILABLE: u8 = 0x03;
    pub const BAD_CREDENTIALS: u8 = 0x04;
    pub const NOT_AUTHORIZED: u8 = 0x05;
}

/// SUBACK code for a refused filter.
pub const SUBACK_FAILURE: u8 = 0x80;

pub const PROTOCOL_NAME_V31: &str = "MQIsdp";
pub const PROTOCOL_NAME_V311: &str = "MQTT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    /// Level the protocol name announces: 3 for "MQIsdp", 4 for "MQTT".
    pub fn expected_level(&self) -> u8 {
        if self.protocol_name == PROTOCOL_NAME_V31 {
            3
        } else {
            4
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    /// Present only for QoS 1 and 2.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttPacket {
    Connect(Box<Connect>),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe { packet_id: u16, filters: Vec<(String, u8)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    Unsubscribe { packet_id: u16, filters: Vec<String> },
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl MqttPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            MqttPacket::Connect(_) => PacketType::Connect,
            MqttPacket::ConnAck { .. } => PacketType::ConnAck,
            MqttPacket::Publish(_) => PacketType::Publish,
            MqttPacket::PubAck(_) => PacketType::PubAck,
            MqttPacket::PubRec(_) => PacketType::PubRec,
            MqttPacket::PubRel(_) => PacketType::PubRel,
            MqttPacket::PubComp(_) => PacketType::PubComp,
            MqttPacket::Subscribe { .. } => PacketType::Subscribe,
            MqttPacket::SubAck { .. } => PacketType::SubAck,
            MqttPacket::Unsubscribe { .. } => PacketType::Unsubscribe,
            MqttPacket::UnsubAck(_) => PacketType::UnsubAck,
            MqttPacket::PingReq => PacketType::PingReq,
            MqttPacket::PingResp => PacketType::PingResp,
            MqttPacket::Disconnect => PacketType::Disconnect,
        }
    }

    /// Decode one whole frame from the packet's position.
    /// On `EndOfBuffer` the position is left untouched.
    pub fn decode(packet: &mut Packet) -> Result<MqttPacket, DecodeError> {
        let bytes = packet.remaining_slice();
        let header = decode_fixed_header(bytes)?;
        if header.frame_len() > bytes.len() {
            return Err(DecodeError::EndOfBuffer);
        }
        let body = &bytes[header.header_len..header.frame_len()];
        let decoded = Self::decode_body(header.first, body)?;
        packet
            .advance(header.frame_len())
            .map_err(|_| DecodeError::EndOfBuffer)?;
        Ok(decoded)
    }

    pub fn decode_body(first: u8, body: &[u8]) -> Result<MqttPacket, DecodeError> {
        let flags = first & 0x0F;
        let kind = PacketType::from_opcode(first >> 4);
        let expect_flags = |expected: u8| {
            if flags == expected {
                Ok(())
            } else {
                Err(DecodeError::malformed(format!(
                    "invalid flags {:#06b} for {:?}",
                    flags, kind
                )))
            }
        };
        let mut reader = Reader::new(body);
        let decoded = match kind {
            PacketType::Connect => {
                expect_flags(0)?;
                MqttPacket::Connect(Box::new(decode_connect(&mut reader)?))
            }
            PacketType::ConnAck => {
                expect_flags(0)?;
                let ack_flags = reader.read_u8()?;
                let code = reader.read_u8()?;
                MqttPacket::ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    code,
                }
            }
            PacketType::Publish => MqttPacket::Publish(decode_publish(flags, &mut reader)?),
            PacketType::PubAck => {
                expect_flags(0)?;
                MqttPacket::PubAck(reader.read_u16()?)
            }
            PacketType::PubRec => {
                expect_flags(0)?;
                MqttPacket::PubRec(reader.read_u16()?)
            }
            PacketType::PubRel => {
                expect_flags(0b0010)?;
                MqttPacket::PubRel(reader.read_u16()?)
            }
            PacketType::PubComp => {
                expect_flags(0)?;
                MqttPacket::PubComp(reader.read_u16()?)
            }
            PacketType::Subscribe => {
                expect_flags(0b0010)?;
                let packet_id = reader.read_u16()?;
                let mut filters = Vec::new();
                while !reader.is_empty() {
                    let filter = reader.read_string()?;
                    let qos = reader.read_u8()?;
                    if qos > 2 {
                        return Err(DecodeError::malformed("requested QoS above 2"));
                    }
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(DecodeError::malformed("SUBSCRIBE without filters"));
                }
                MqttPacket::Subscribe { packet_id, filters }
            }
            PacketType::SubAck => {
                expect_flags(0)?;
                let packet_id = reader.read_u16()?;
                let codes = reader.read_rest().to_vec();
                MqttPacket::SubAck { packet_id, codes }
            }
            PacketType::Unsubscribe => {
                expect_flags(0b0010)?;
                let packet_id = reader.read_u16()?;
                let mut filters = Vec::new();
                while !reader.is_empty() {
                    filters.push(reader.read_string()?);
                }
                if filters.is_empty() {
                    return Err(DecodeError::malformed("UNSUBSCRIBE without filters"));
                }
                MqttPacket::Unsubscribe { packet_id, filters }
            }
            PacketType::UnsubAck => {
                expect_flags(0)?;
                MqttPacket::UnsubAck(reader.read_u16()?)
            }
            PacketType::PingReq => {
                expect_flags(0)?;
                MqttPacket::PingReq
            }
            PacketType::PingResp => {
                expect_flags(0)?;
                MqttPacket::PingResp
            }
            PacketType::Disconnect => {
                expect_flags(0)?;
                MqttPacket::Disconnect
            }
            PacketType::Reserved | PacketType::Auth => {
                return Err(DecodeError::malformed(format!(
                    "reserved packet type {}",
                    first >> 4
                )))
            }
        };
        if !reader.is_empty() {
            return Err(DecodeError::malformed(format!(
                "{} trailing bytes after {:?}",
                reader.remaining(),
                kind
            )));
        }
        Ok(decoded)
    }

    /// Serialize the whole frame, or nothing when it does not fit.
    pub fn encode(&self, packet: &mut Packet) -> Result<usize, PacketError> {
        let mut body = Writer::new();
        let first = match self {
            MqttPacket::Connect(connect) => {
                encode_connect(connect, &mut body);
                0x10
            }
            MqttPacket::ConnAck {
                session_present,
                code,
            } => {
                body.u8(*session_present as u8).u8(*code);
                0x20
            }
            MqttPacket::Publish(publish) => {
                body.string(&publish.topic);
                if let Some(id) = publish.packet_id {
                    body.u16(id);
                }
                body.bytes(&publish.payload);
                0x30 | (publish.dup as u8) << 3 | (publish.qos & 0x03) << 1 | publish.retain as u8
            }
            MqttPacket::PubAck(id) => {
                body.u16(*id);
                0x40
            }
            MqttPacket::PubRec(id) => {
                body.u16(*id);
                0x50
            }
            MqttPacket::PubRel(id) => {
                body.u16(*id);
                0x62
            }
            MqttPacket::PubComp(id) => {
                body.u16(*id);
                0x70
            }
            MqttPacket::Subscribe { packet_id, filters } => {
                body.u16(*packet_id);
                for (filter, qos) in filters {
                    body.string(filter).u8(*qos);
                }
                0x82
            }
            MqttPacket::SubAck { packet_id, codes } => {
                body.u16(*packet_id).bytes(codes);
                0x90
            }
            MqttPacket::Unsubscribe { packet_id, filters } => {
                body.u16(*packet_id);
                for filter in filters {
                    body.string(filter);
                }
                0xA2
            }
            MqttPacket::UnsubAck(id) => {
                body.u16(*id);
                0xB0
            }
            MqttPacket::PingReq => 0xC0,
            MqttPacket::PingResp => 0xD0,
            MqttPacket::Disconnect => 0xE0,
        };
        put_frame(packet, first, body.as_slice())
    }
}

fn decode_connect(reader: &mut Reader<'_>) -> Result<Connect, DecodeError> {
    let protocol_name = reader.read_string()?;
    if protocol_name != PROTOCOL_NAME_V311 && protocol_name != PROTOCOL_NAME_V31 {
        return Err(DecodeError::malformed(format!(
            "unknown protocol name {:?}",
            protocol_name
        )));
    }
    let protocol_level = reader.read_u8()?;
    let mut connect = Connect {
        protocol_name,
        protocol_level,
        clean_session: false,
        keep_alive: 0,
        client_id: String::new(),
        will: None,
        username: None,
        password: None,
    };
    if protocol_level != 3 && protocol_level != 4 {
        // the rest of the variable header is not ours to parse; the listener refuses the level
        reader.read_rest();
        return Ok(connect);
    }
    let flags = reader.read_u8()?;
    if flags & 0x01 != 0 {
        return Err(DecodeError::malformed("reserved connect flag set"));
    }
    connect.clean_session = flags & 0x02 != 0;
    let has_will = flags & 0x04 != 0;
    let will_qos = (flags >> 3) & 0x03;
    let will_retain = flags & 0x20 != 0;
    let has_password = flags & 0x40 != 0;
    let has_username = flags & 0x80 != 0;
    if will_qos > 2 {
        return Err(DecodeError::malformed("will QoS above 2"));
    }
    if !has_will && (will_qos != 0 || will_retain) {
        return Err(DecodeError::malformed("will QoS or retain without will flag"));
    }
    if protocol_level == 4 && has_password && !has_username {
        return Err(DecodeError::malformed("password without user name"));
    }
    connect.keep_alive = reader.read_u16()?;
    connect.client_id = reader.read_string()?;
    if has_will {
        let topic = reader.read_string()?;
        let message = reader.read_binary()?.to_vec();
        connect.will = Some(LastWill {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        });
    }
    if has_username {
        connect.username = Some(reader.read_string()?);
    }
    if has_password {
        connect.password = Some(reader.read_binary()?.to_vec());
    }
    Ok(connect)
}

fn encode_connect(connect: &Connect, body: &mut Writer) {
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | (will.qos & 0x03) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.string(&connect.protocol_name)
        .u8(connect.protocol_level)
        .u8(flags)
        .u16(connect.keep_alive)
        .string(&connect.client_id);
    if let Some(will) = &connect.will {
        body.string(&will.topic).binary(&will.message);
    }
    if let Some(username) = &connect.username {
        body.string(username);
    }
    if let Some(password) = &connect.password {
        body.binary(password);
    }
}

fn decode_publish(flags: u8, reader: &mut Reader<'_>) -> Result<Publish, DecodeError> {
    let qos = (flags >> 1) & 0x03;
    if qos > 2 {
        return Err(DecodeError::malformed("PUBLISH with QoS 3"));
    }
    let dup = flags & 0x08 != 0;
    if qos == 0 && dup {
        return Err(DecodeError::malformed("DUP set on a QoS 0 PUBLISH"));
    }
    let topic = reader.read_string()?;
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(DecodeError::malformed(format!(
            "invalid topic name {:?}",
            topic
        )));
    }
    let packet_id = if qos > 0 {
        match reader.read_u16()? {
            0 => return Err(DecodeError::malformed("packet id 0")),
            id => Some(id),
        }
    } else {
        None
    };
    Ok(Publish {
        dup,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: reader.read_rest().to_vec(),
    })
}
