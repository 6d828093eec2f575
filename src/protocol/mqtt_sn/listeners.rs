//! Opcode table for MQTT-SN. Same contract as the MQTT table: a listener may return a reply for the
//! current peer; errors drop that peer's state.
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;

use super::packet::{return_code, Flags, MsgType, SnPacket, TopicIdType, TopicRef, PROTOCOL_ID};
use super::{short_name, PeerState, SnContext, SnFrame};
use crate::protocol::{ConnectionSink, MalformedPacket, ProtocolEvent};
use crate::session::{
    is_valid_filter, Destination, DestinationKind, Message, Session, SessionContext, SessionError,
    SubscriptionContext,
};

type DestinationResult = Result<Arc<dyn Destination>, SessionError>;

/// Longest client id MQTT-SN allows.
const MAX_CLIENT_ID_LEN: usize = 23;

pub trait SnPacketListener: Sync {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket>;
}

pub struct SnListenerTable;

impl SnListenerTable {
    pub fn get_listener(msg_type: u8) -> &'static dyn SnPacketListener {
        match MsgType::from_u8(msg_type) {
            MsgType::SearchGw => &SearchGwListener,
            MsgType::Connect => &ConnectListener,
            MsgType::Register => &RegisterListener,
            MsgType::RegAck => &RegAckListener,
            MsgType::Publish => &PublishListener,
            MsgType::PubAck => &PubAckListener,
            MsgType::PubRec => &PubRecListener,
            MsgType::PubRel => &PubRelListener,
            MsgType::Subscribe => &SubscribeListener,
            MsgType::Unsubscribe => &UnsubscribeListener,
            MsgType::PingReq => &PingReqListener,
            MsgType::Disconnect => &DisconnectListener,
            _ => &NoOpListener,
        }
    }
}

pub struct NoOpListener;

impl SnPacketListener for NoOpListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        match packet {
            SnPacket::Advertise { gateway_id, .. } | SnPacket::GwInfo { gateway_id } => {
                info!("gateway {} seen at {}", gateway_id, ctx.peer)
            }
            other => trace!("{} ignoring {:?}", ctx.peer, other.msg_type()),
        }
        Ok(None)
    }
}

/// Store `message` on `topic` through `session`, outside any transaction.
fn store(session: &Arc<dyn Session>, topic: &str, message: Message, peer: std::net::SocketAddr) {
    session.find_destination(
        topic,
        DestinationKind::Topic,
        Box::new(move |result: DestinationResult| match result {
            Ok(destination) => {
                if let Err(err) = destination.store_message(message) {
                    warn!("{} store failed: {}", peer, err);
                }
            }
            Err(err) => warn!("{} no destination: {}", peer, err),
        }),
    );
}

//====================================================================================
//            gateway discovery and CONNECT
//====================================================================================

pub struct SearchGwListener;

impl SnPacketListener for SearchGwListener {
    fn handle(
        &self,
        _packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        debug!("{} searching for gateways", ctx.peer);
        Ok(Some(ctx.reply(SnPacket::GwInfo {
            gateway_id: ctx.state.config.gateway_id,
        })))
    }
}

pub struct ConnectListener;

impl SnPacketListener for ConnectListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        let (flags, protocol_id, duration, client_id) = match packet {
            SnPacket::Connect {
                flags,
                protocol_id,
                duration,
                client_id,
            } => (flags, protocol_id, duration, client_id),
            _ => return Ok(None),
        };
        let refuse = |ctx: &SnContext<'_>, why: &str| {
            info!("{} CONNECT refused: {}", ctx.peer, why);
            Ok(Some(ctx.reply(SnPacket::ConnAck {
                code: return_code::NOT_SUPPORTED,
            })))
        };
        if protocol_id != PROTOCOL_ID {
            return refuse(ctx, "unknown protocol id");
        }
        if flags.will {
            return refuse(ctx, "wills are not supported");
        }
        if client_id.is_empty() || client_id.chars().count() > MAX_CLIENT_ID_LEN {
            return refuse(ctx, "client id length");
        }

        // a reconnect from the same address replaces the old state
        ctx.state.remove_peer(&ctx.peer, true);
        let keep_alive = Duration::from_secs(duration as u64);
        ctx.state.peers.insert(
            ctx.peer,
            PeerState::new(
                client_id.clone(),
                keep_alive,
                ctx.state.config.max_registered_size,
            ),
        );
        debug!("{} CONNECT client {} keep alive {:?}", ctx.peer, client_id, keep_alive);

        let context = SessionContext {
            client_id,
            protocol: super::PROTOCOL_NAME,
            remote: Some(ctx.peer),
            clean_session: flags.clean_session,
            keep_alive,
            username: None,
            password: None,
            will: None,
            listener: ConnectionSink::new(ctx.task, Some(ctx.peer)),
        };
        let task = Arc::clone(ctx.task);
        let peer = ctx.peer;
        ctx.state.sessions.create_session(
            context,
            Box::new(move |result| {
                task.post(ProtocolEvent::SessionCreated {
                    peer: Some(peer),
                    result,
                })
            }),
        );
        Ok(None)
    }
}

//====================================================================================
//            topic registration
//====================================================================================

pub struct RegisterListener;

impl SnPacketListener for RegisterListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        let (msg_id, topic_name) = match packet {
            SnPacket::Register {
                msg_id, topic_name, ..
            } => (msg_id, topic_name),
            _ => return Ok(None),
        };
        if ctx.state.session(&ctx.peer)?.is_none() {
            return Ok(None);
        }
        let (topic_id, code) = if topic_name.is_empty() || topic_name.contains(['+', '#']) {
            (0, return_code::NOT_SUPPORTED)
        } else {
            match ctx
                .state
                .peers
                .get_mut(&ctx.peer)
                .and_then(|p| p.topics.register(&topic_name))
            {
                Some(id) => (id, return_code::ACCEPTED),
                None => (0, return_code::CONGESTION),
            }
        };
        debug!("{} REGISTER {} -> {} ({})", ctx.peer, topic_name, topic_id, code);
        Ok(Some(ctx.reply(SnPacket::RegAck {
            topic_id,
            msg_id,
            code,
        })))
    }
}

/// REGACK for a topic we registered ahead of a delivery.
pub struct RegAckListener;

impl SnPacketListener for RegAckListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        if let SnPacket::RegAck { topic_id, code, .. } = packet {
            if code != return_code::ACCEPTED {
                warn!("{} refused topic id {}: {}", ctx.peer, topic_id, code);
                if let Some(state) = ctx.state.peers.get_mut(&ctx.peer) {
                    state.topics.remove(topic_id);
                }
            }
        }
        Ok(None)
    }
}

//====================================================================================
//            PUBLISH and its acknowledgements
//====================================================================================

pub struct PublishListener;

impl SnPacketListener for PublishListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        let (flags, topic_id, msg_id, data) = match packet {
            SnPacket::Publish {
                flags,
                topic_id,
                msg_id,
                data,
            } => (flags, topic_id, msg_id, data),
            _ => return Ok(None),
        };
        let session = match ctx.state.session(&ctx.peer)? {
            Some(session) => session,
            None => {
                debug!(
                    "{} publish without a session dropped (qos bits {})",
                    ctx.peer, flags.qos
                );
                return Ok(None);
            }
        };
        let qos = flags.qos_level();
        let topic = match ctx
            .state
            .resolve_topic(&ctx.peer, flags.topic_id_type, topic_id)
        {
            Some(topic) => topic,
            None if qos > 0 => {
                return Ok(Some(ctx.reply(SnPacket::PubAck {
                    topic_id,
                    msg_id,
                    code: return_code::INVALID_TOPIC_ID,
                })))
            }
            None => {
                debug!("{} publish to unknown topic id {}", ctx.peer, topic_id);
                return Ok(None);
            }
        };
        let message = Message {
            payload: data,
            qos,
            retain: flags.retain,
        };
        match qos {
            0 => {
                store(&session, &topic, message, ctx.peer);
                Ok(None)
            }
            1 => {
                let mut transaction = session.start_transaction();
                let task = Arc::clone(ctx.task);
                let peer = ctx.peer;
                session.find_destination(
                    &topic,
                    DestinationKind::Topic,
                    Box::new(move |result: DestinationResult| match result {
                        Ok(destination) => {
                            transaction.add(destination, message);
                            let ack = SnFrame::new(
                                peer,
                                SnPacket::PubAck {
                                    topic_id,
                                    msg_id,
                                    code: return_code::ACCEPTED,
                                },
                            )
                            .with_completion(move || {
                                if let Err(err) = transaction.commit() {
                                    warn!("{} commit failed: {}", peer, err);
                                }
                            });
                            task.push(Box::new(ack));
                        }
                        Err(err) => {
                            warn!("{} no destination: {}", peer, err);
                            transaction.abort();
                            task.push(Box::new(SnFrame::new(
                                peer,
                                SnPacket::PubAck {
                                    topic_id,
                                    msg_id,
                                    code: return_code::INVALID_TOPIC_ID,
                                },
                            )));
                        }
                    }),
                );
                Ok(None)
            }
            _ => {
                if let Some(state) = ctx.state.peers.get_mut(&ctx.peer) {
                    state
                        .inbound_qos2
                        .entry(msg_id)
                        .or_insert((topic, message));
                }
                Ok(Some(ctx.reply(SnPacket::PubRec(msg_id))))
            }
        }
    }
}

pub struct PubRelListener;

impl SnPacketListener for PubRelListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        let msg_id = match packet {
            SnPacket::PubRel(msg_id) => msg_id,
            _ => return Ok(None),
        };
        let session = match ctx.state.session(&ctx.peer)? {
            Some(session) => session,
            None => return Ok(None),
        };
        let held = ctx
            .state
            .peers
            .get_mut(&ctx.peer)
            .and_then(|p| p.inbound_qos2.remove(&msg_id));
        let (topic, message) = match held {
            Some(held) => held,
            None => return Ok(Some(ctx.reply(SnPacket::PubComp(msg_id)))),
        };
        let mut transaction = session.start_transaction();
        let task = Arc::clone(ctx.task);
        let peer = ctx.peer;
        session.find_destination(
            &topic,
            DestinationKind::Topic,
            Box::new(move |result: DestinationResult| {
                match result {
                    Ok(destination) => {
                        transaction.add(destination, message);
                        if let Err(err) = transaction.commit() {
                            warn!("{} commit failed: {}", peer, err);
                        }
                    }
                    Err(err) => {
                        warn!("{} no destination: {}", peer, err);
                        transaction.abort();
                    }
                }
                task.push(Box::new(SnFrame::new(peer, SnPacket::PubComp(msg_id))));
            }),
        );
        Ok(None)
    }
}

/// PUBREC for one of our QoS 2 deliveries.
pub struct PubRecListener;

impl SnPacketListener for PubRecListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        match packet {
            SnPacket::PubRec(msg_id) if ctx.state.session(&ctx.peer)?.is_some() => {
                Ok(Some(ctx.reply(SnPacket::PubRel(msg_id))))
            }
            _ => Ok(None),
        }
    }
}

/// PUBACK for one of our deliveries; a rejected topic id is forgotten so the next delivery registers again.
pub struct PubAckListener;

impl SnPacketListener for PubAckListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        if let SnPacket::PubAck { topic_id, code, .. } = packet {
            if code == return_code::INVALID_TOPIC_ID {
                if let Some(state) = ctx.state.peers.get_mut(&ctx.peer) {
                    state.topics.remove(topic_id);
                }
            }
        }
        Ok(None)
    }
}

//====================================================================================
//            SUBSCRIBE / UNSUBSCRIBE
//====================================================================================

/// Resolve a SUBSCRIBE or UNSUBSCRIBE topic to a filter string.
fn filter_of(ctx: &SnContext<'_>, topic: &TopicRef) -> Option<String> {
    match topic {
        TopicRef::Name(name) => Some(name.clone()),
        TopicRef::Predefined(id) => ctx.state.predefined_topic(*id).map(str::to_owned),
        TopicRef::Short(bytes) => short_name(*bytes),
    }
}

pub struct SubscribeListener;

impl SnPacketListener for SubscribeListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        let (flags, msg_id, topic) = match packet {
            SnPacket::Subscribe {
                flags,
                msg_id,
                topic,
            } => (flags, msg_id, topic),
            _ => return Ok(None),
        };
        let session = match ctx.state.session(&ctx.peer)? {
            Some(session) => session,
            None => return Ok(None),
        };
        let refuse = |ctx: &SnContext<'_>, code: u8| {
            Ok(Some(ctx.reply(SnPacket::SubAck {
                flags: Flags::default(),
                topic_id: 0,
                msg_id,
                code,
            })))
        };
        let filter = match filter_of(ctx, &topic) {
            Some(filter) if is_valid_filter(&filter) => filter,
            _ => return refuse(ctx, return_code::INVALID_TOPIC_ID),
        };
        let granted = match session.add_subscription(SubscriptionContext {
            filter: filter.clone(),
            qos: flags.qos_level(),
        }) {
            Ok(granted) => granted,
            Err(err) => {
                info!("{} subscribe {} refused: {}", ctx.peer, filter, err);
                return refuse(ctx, return_code::NOT_SUPPORTED);
            }
        };
        let topic_id = match topic {
            TopicRef::Predefined(id) => id,
            TopicRef::Name(_) if !filter.contains(['+', '#']) => ctx
                .state
                .peers
                .get_mut(&ctx.peer)
                .and_then(|p| p.topics.register(&filter))
                .unwrap_or(0),
            _ => 0,
        };
        debug!("{} SUBSCRIBE {} qos {} id {}", ctx.peer, filter, granted, topic_id);
        Ok(Some(ctx.reply(SnPacket::SubAck {
            flags: Flags::with_qos(granted, TopicIdType::Normal),
            topic_id,
            msg_id,
            code: return_code::ACCEPTED,
        })))
    }
}

pub struct UnsubscribeListener;

impl SnPacketListener for UnsubscribeListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        let (msg_id, topic) = match packet {
            SnPacket::Unsubscribe { msg_id, topic, .. } => (msg_id, topic),
            _ => return Ok(None),
        };
        let session = match ctx.state.session(&ctx.peer)? {
            Some(session) => session,
            None => return Ok(None),
        };
        if let Some(filter) = filter_of(ctx, &topic) {
            if !session.remove_subscription(&filter) {
                debug!("{} not subscribed to {}", ctx.peer, filter);
            }
        }
        Ok(Some(ctx.reply(SnPacket::UnsubAck(msg_id))))
    }
}

//====================================================================================
//            PINGREQ / DISCONNECT
//====================================================================================

pub struct PingReqListener;

impl SnPacketListener for PingReqListener {
    fn handle(
        &self,
        _packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        if ctx.state.session(&ctx.peer)?.is_none() {
            return Ok(None);
        }
        Ok(Some(ctx.reply(SnPacket::PingResp)))
    }
}

/// DISCONNECT, with or without a sleep duration, ends the peer's session; sleeping clients are not kept.
pub struct DisconnectListener;

impl SnPacketListener for DisconnectListener {
    fn handle(
        &self,
        packet: SnPacket,
        ctx: &mut SnContext<'_>,
    ) -> Result<Option<SnFrame>, MalformedPacket> {
        if !ctx.state.peers.contains_key(&ctx.peer) {
            return Ok(None);
        }
        if let SnPacket::Disconnect {
            duration: Some(duration),
        } = packet
        {
            debug!("{} asked to sleep {}s; disconnecting instead", ctx.peer, duration);
        }
        ctx.state.remove_peer(&ctx.peer, true);
        Ok(Some(ctx.reply(SnPacket::Disconnect { duration: None })))
    }
}
