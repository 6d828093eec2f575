//! Opcode table for MQTT.
//!
//! Each listener handles one packet type against the connection's protocol state and may return a reply,
//! which the caller pushes onto the connection. Replies that depend on session work are pushed later from the
//! session callback instead.
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;

use super::packet::{connack, Connect, MqttPacket, PacketType, Publish, SUBACK_FAILURE};
use super::{MqttContext, MqttFrame, Phase};
use crate::protocol::{ConnectionSink, MalformedPacket, ProtocolEvent};
use crate::session::{
    Destination, DestinationKind, Message, SessionContext, SessionError, SubscriptionContext, Will,
};

type DestinationResult = Result<Arc<dyn Destination>, SessionError>;

/// Client ids allowed by MQTT 3.1.
const MAX_CLIENT_ID_LEN_V31: usize = 23;

pub trait PacketListener: Sync {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket>;
}

pub struct ListenerTable;

impl ListenerTable {
    pub fn get_listener(opcode: u8) -> &'static dyn PacketListener {
        match PacketType::from_opcode(opcode) {
            PacketType::Connect => &ConnectListener,
            PacketType::Publish => &PublishListener,
            PacketType::PubRec => &PubRecListener,
            PacketType::PubRel => &PubRelListener,
            PacketType::Subscribe => &SubscribeListener,
            PacketType::Unsubscribe => &UnsubscribeListener,
            PacketType::PingReq => &PingReqListener,
            PacketType::Disconnect => &DisconnectListener,
            _ => &NoOpListener,
        }
    }
}

/// Acknowledgements of our own deliveries and server-bound packets a client has no business sending.
pub struct NoOpListener;

impl PacketListener for NoOpListener {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        trace!("{} ignoring {:?}", ctx.task.name(), packet.packet_type());
        Ok(None)
    }
}

//====================================================================================
//            CONNECT
//====================================================================================

pub struct ConnectListener;

impl ConnectListener {
    fn is_valid_client_id(client_id: &str, level: u8, strict: bool, max_len: usize) -> bool {
        let len = client_id.chars().count();
        if level == 3 && len > MAX_CLIENT_ID_LEN_V31 {
            return false;
        }
        if strict {
            return len <= max_len && client_id.chars().all(|c| c.is_ascii_alphanumeric());
        }
        true
    }

    fn refuse(ctx: &MqttContext<'_>, code: u8, close_after: Option<Duration>) -> MqttFrame {
        let frame = MqttFrame::new(MqttPacket::ConnAck {
            session_present: false,
            code,
        });
        match close_after {
            Some(delay) => {
                let task = Arc::downgrade(ctx.task);
                frame.with_completion(move || {
                    if let Some(task) = task.upgrade() {
                        task.schedule_close(delay);
                    }
                })
            }
            None => frame,
        }
    }
}

impl PacketListener for ConnectListener {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        let connect: Connect = match packet {
            MqttPacket::Connect(connect) => *connect,
            _ => return Ok(None),
        };
        if !matches!(ctx.state.phase, Phase::Idle) {
            return Err(MalformedPacket::new("second CONNECT on one connection"));
        }
        let config = &ctx.state.config;

        if connect.protocol_level != connect.expected_level() {
            warn!(
                "{} unsupported protocol {} level {}",
                ctx.task.name(),
                connect.protocol_name,
                connect.protocol_level
            );
            let delay = config.close_delay();
            ctx.state.phase = Phase::Refused;
            return Ok(Some(Self::refuse(
                ctx,
                connack::UNACCEPTABLE_PROTOCOL_VERSION,
                Some(delay),
            )));
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                info!("{} empty client id without clean session", ctx.task.name());
                return Ok(Some(Self::refuse(ctx, connack::IDENTIFIER_REJECTED, None)));
            }
            uuid::Uuid::new_v4().simple().to_string()
        } else if Self::is_valid_client_id(
            &connect.client_id,
            connect.protocol_level,
            config.strict_client_id,
            config.max_client_id_len,
        ) {
            connect.client_id
        } else {
            info!(
                "{} rejected client id {:?}",
                ctx.task.name(),
                connect.client_id
            );
            return Ok(Some(Self::refuse(ctx, connack::IDENTIFIER_REJECTED, None)));
        };

        let keep_alive = connect
            .keep_alive
            .max(config.min_keep_alive_secs)
            .min(config.max_keep_alive_secs);
        ctx.state.keep_alive = Duration::from_secs(keep_alive as u64);
        ctx.state.client_id = client_id.clone();
        ctx.state.phase = Phase::Connecting;
        debug!(
            "{} CONNECT client {} level {} keep alive {}s",
            ctx.task.name(),
            client_id,
            connect.protocol_level,
            keep_alive
        );

        let context = SessionContext {
            client_id,
            protocol: super::PROTOCOL_NAME,
            remote: ctx.task.remote_address(),
            clean_session: connect.clean_session,
            keep_alive: ctx.state.keep_alive,
            username: connect.username,
            password: connect.password,
            will: connect.will.map(|will| Will {
                topic: will.topic,
                message: Message {
                    payload: will.message,
                    qos: will.qos,
                    retain: will.retain,
                },
            }),
            listener: ConnectionSink::new(ctx.task, None),
        };
        let task = Arc::clone(ctx.task);
        ctx.state.sessions.create_session(
            context,
            Box::new(move |result| task.post(ProtocolEvent::SessionCreated { peer: None, result })),
        );
        Ok(None)
    }
}

//====================================================================================
//            PUBLISH and its acknowledgements
//====================================================================================

pub struct PublishListener;

impl PacketListener for PublishListener {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        let publish: Publish = match packet {
            MqttPacket::Publish(publish) => publish,
            _ => return Ok(None),
        };
        let session = ctx.state.session()?;
        let skip = publish.topic.starts_with('$');
        if skip {
            debug!(
                "{} dropping publish to reserved topic {}",
                ctx.task.name(),
                publish.topic
            );
        }
        let message = Message {
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };
        let topic = publish.topic;
        match (publish.qos, publish.packet_id) {
            (0, _) => {
                if !skip {
                    let name = ctx.task.name().to_owned();
                    session.find_destination(
                        &topic,
                        DestinationKind::Topic,
                        Box::new(move |result: DestinationResult| match result {
                            Ok(destination) => {
                                if let Err(err) = destination.store_message(message) {
                                    warn!("{} store failed: {}", name, err);
                                }
                            }
                            Err(err) => warn!("{} no destination: {}", name, err),
                        }),
                    );
                }
                Ok(None)
            }
            (1, Some(packet_id)) => {
                if skip {
                    return Ok(Some(MqttFrame::new(MqttPacket::PubAck(packet_id))));
                }
                let mut transaction = session.start_transaction();
                let task = Arc::clone(ctx.task);
                session.find_destination(
                    &topic,
                    DestinationKind::Topic,
                    Box::new(move |result: DestinationResult| match result {
                        Ok(destination) => {
                            transaction.add(destination, message);
                            let name = task.name().to_owned();
                            let ack = MqttFrame::new(MqttPacket::PubAck(packet_id))
                                .with_completion(move || {
                                    if let Err(err) = transaction.commit() {
                                        warn!("{} commit failed: {}", name, err);
                                    }
                                });
                            task.push(Box::new(ack));
                        }
                        Err(err) => {
                            warn!("{} no destination: {}", task.name(), err);
                            transaction.abort();
                            task.close();
                        }
                    }),
                );
                Ok(None)
            }
            (2, Some(packet_id)) => {
                if !skip {
                    // a redelivered PUBLISH keeps the first copy
                    ctx.state
                        .inbound_qos2
                        .entry(packet_id)
                        .or_insert((topic, message));
                }
                Ok(Some(MqttFrame::new(MqttPacket::PubRec(packet_id))))
            }
            _ => Err(MalformedPacket::new("PUBLISH without packet id")),
        }
    }
}

/// PUBREL from a publisher: store the held QoS 2 message, then PUBCOMP.
pub struct PubRelListener;

impl PacketListener for PubRelListener {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        let packet_id = match packet {
            MqttPacket::PubRel(packet_id) => packet_id,
            _ => return Ok(None),
        };
        let session = ctx.state.session()?;
        let (topic, message) = match ctx.state.inbound_qos2.remove(&packet_id) {
            Some(held) => held,
            // already released, or dropped as reserved
            None => return Ok(Some(MqttFrame::new(MqttPacket::PubComp(packet_id)))),
        };
        let mut transaction = session.start_transaction();
        let task = Arc::clone(ctx.task);
        session.find_destination(
            &topic,
            DestinationKind::Topic,
            Box::new(move |result: DestinationResult| {
                match result {
                    Ok(destination) => {
                        transaction.add(destination, message);
                        if let Err(err) = transaction.commit() {
                            warn!("{} commit failed: {}", task.name(), err);
                        }
                    }
                    Err(err) => {
                        warn!("{} no destination: {}", task.name(), err);
                        transaction.abort();
                    }
                }
                task.push(Box::new(MqttFrame::new(MqttPacket::PubComp(packet_id))));
            }),
        );
        Ok(None)
    }
}

/// PUBREC from a subscriber for one of our QoS 2 deliveries.
pub struct PubRecListener;

impl PacketListener for PubRecListener {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        match packet {
            MqttPacket::PubRec(packet_id) => {
                ctx.state.session()?;
                Ok(Some(MqttFrame::new(MqttPacket::PubRel(packet_id))))
            }
            _ => Ok(None),
        }
    }
}

//====================================================================================
//            SUBSCRIBE / UNSUBSCRIBE
//====================================================================================

pub struct SubscribeListener;

impl PacketListener for SubscribeListener {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        let (packet_id, filters) = match packet {
            MqttPacket::Subscribe { packet_id, filters } => (packet_id, filters),
            _ => return Ok(None),
        };
        let session = ctx.state.session()?;
        let codes = filters
            .into_iter()
            .map(|(filter, qos)| {
                match session.add_subscription(SubscriptionContext {
                    filter: filter.clone(),
                    qos,
                }) {
                    Ok(granted) => granted,
                    Err(err) => {
                        info!("{} subscribe {} refused: {}", ctx.task.name(), filter, err);
                        SUBACK_FAILURE
                    }
                }
            })
            .collect();
        Ok(Some(MqttFrame::new(MqttPacket::SubAck { packet_id, codes })))
    }
}

pub struct UnsubscribeListener;

impl PacketListener for UnsubscribeListener {
    fn handle(
        &self,
        packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        let (packet_id, filters) = match packet {
            MqttPacket::Unsubscribe { packet_id, filters } => (packet_id, filters),
            _ => return Ok(None),
        };
        let session = ctx.state.session()?;
        for filter in &filters {
            if !session.remove_subscription(filter) {
                debug!("{} not subscribed to {}", ctx.task.name(), filter);
            }
        }
        Ok(Some(MqttFrame::new(MqttPacket::UnsubAck(packet_id))))
    }
}

//====================================================================================
//            PINGREQ / DISCONNECT
//====================================================================================

pub struct PingReqListener;

impl PacketListener for PingReqListener {
    fn handle(
        &self,
        _packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        ctx.state.session()?;
        Ok(Some(MqttFrame::new(MqttPacket::PingResp)))
    }
}

pub struct DisconnectListener;

impl PacketListener for DisconnectListener {
    fn handle(
        &self,
        _packet: MqttPacket,
        ctx: &mut MqttContext<'_>,
    ) -> Result<Option<MqttFrame>, MalformedPacket> {
        debug!("{} DISCONNECT", ctx.task.name());
        ctx.state.graceful = true;
        ctx.task.close();
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_client_id_rules() {
        let valid = ConnectListener::is_valid_client_id;
        assert!(valid("abc123", 4, true, 23));
        assert!(!valid("abc-123", 4, true, 23));
        assert!(valid("abc-123", 4, false, 23));
        assert!(!valid(&"a".repeat(24), 4, true, 23));
        assert!(valid(&"a".repeat(64), 4, false, 23));
        assert!(valid(&"a".repeat(64), 4, true, 64));
        // MQTT 3.1 caps the length regardless of strictness
        assert!(!valid(&"a".repeat(30), 3, false, 64));
        assert!(valid(&"a".repeat(23), 3, true, 23));
    }

    #[test]
    fn test_unknown_opcodes_resolve_to_noop() {
        // must not panic for any nibble
        for opcode in 0..=255u8 {
            let _ = ListenerTable::get_listener(opcode);
        }
    }
}
