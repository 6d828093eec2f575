//! MQTT-SN 1.2 over datagram transports.
//!
//! One protocol instance serves every client behind a UDP endpoint, so all state is keyed by the peer address.
//! A malformed message drops only the offending peer's state; the endpoint stays up.
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::MqttSnConfig;
use crate::connection::ConnectionTask;
use crate::frame::ServerPacket;
use crate::packet::{Packet, PacketError};
use crate::protocol::mqtt::codec::DecodeError;
use crate::protocol::{MalformedPacket, Protocol, ProtocolEvent, ProtocolFactory};
use crate::session::{Delivery, Message, Session, SessionError, SessionManager};

pub mod listeners;
pub mod packet;

use listeners::SnListenerTable;
pub use packet::{return_code, Flags, MsgType, SnPacket, TopicIdType, TopicRef};

pub const PROTOCOL_NAME: &str = "mqtt-sn";

//====================================================================================
//            SnFrame
//====================================================================================

/// An outbound MQTT-SN message addressed to one peer.
pub struct SnFrame {
    packet: SnPacket,
    address: Option<SocketAddr>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl SnFrame {
    pub fn new(peer: SocketAddr, packet: SnPacket) -> Self {
        Self {
            packet,
            address: Some(peer),
            on_complete: None,
        }
    }
    pub fn with_completion(mut self, on_complete: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }
    pub fn packet(&self) -> &SnPacket {
        &self.packet
    }
}

impl ServerPacket for SnFrame {
    fn pack_frame(&self, packet: &mut Packet) -> Result<usize, PacketError> {
        self.packet.encode(packet)
    }
    fn complete(self: Box<Self>) {
        if let Some(cb) = self.on_complete {
            cb();
        }
    }
    fn from_address(&self) -> Option<SocketAddr> {
        self.address
    }
    fn set_from_address(&mut self, addr: Option<SocketAddr>) {
        self.address = addr;
    }
}

//====================================================================================
//            per-peer state
//====================================================================================

/// Topic names registered with one client, by id.
pub struct TopicRegistry {
    by_id: HashMap<u16, String>,
    by_name: HashMap<String, u16>,
    next_id: u16,
    limit: usize,
}

impl TopicRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            next_id: 0,
            limit,
        }
    }
    pub fn len(&self) -> usize {
        self.by_id.len()
    }
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
    pub fn topic(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }
    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// return the topic's id, assigning one if needed, or None when the registry is full.
    pub fn register(&mut self, name: &str) -> Option<u16> {
        if let Some(id) = self.id_of(name) {
            return Some(id);
        }
        if self.by_id.len() >= self.limit || self.by_id.len() >= (u16::MAX - 1) as usize {
            return None;
        }
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            // 0 and 0xFFFF are reserved
            if self.next_id != 0 && self.next_id != u16::MAX && !self.by_id.contains_key(&self.next_id) {
                break;
            }
        }
        self.by_id.insert(self.next_id, name.to_owned());
        self.by_name.insert(name.to_owned(), self.next_id);
        Some(self.next_id)
    }

    pub fn remove(&mut self, id: u16) {
        if let Some(name) = self.by_id.remove(&id) {
            self.by_name.remove(&name);
        }
    }
}

pub(crate) enum PeerPhase {
    Connecting,
    Connected(Arc<dyn Session>),
}

pub(crate) struct PeerState {
    pub(crate) client_id: String,
    pub(crate) phase: PeerPhase,
    pub(crate) keep_alive: Duration,
    pub(crate) last_seen: Instant,
    pub(crate) topics: TopicRegistry,
    pub(crate) inbound_qos2: HashMap<u16, (String, Message)>,
    next_msg_id: u16,
}

impl PeerState {
    pub(crate) fn new(client_id: String, keep_alive: Duration, topic_limit: usize) -> Self {
        Self {
            client_id,
            phase: PeerPhase::Connecting,
            keep_alive,
            last_seen: Instant::now(),
            topics: TopicRegistry::new(topic_limit),
            inbound_qos2: HashMap::new(),
            next_msg_id: 0,
        }
    }

    pub(crate) fn next_msg_id(&mut self) -> u16 {
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
        self.next_msg_id
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        if self.keep_alive.is_zero() {
            None
        } else {
            Some(self.keep_alive * 3 / 2)
        }
    }
}

/// State shared by every peer of one endpoint, only touched on the owning selector loop.
pub struct SnState {
    pub(crate) config: MqttSnConfig,
    pub(crate) sessions: Arc<dyn SessionManager>,
    pub(crate) peers: HashMap<SocketAddr, PeerState>,
    predefined_by_id: HashMap<u16, String>,
    predefined_by_name: HashMap<String, u16>,
}

impl SnState {
    fn new(config: MqttSnConfig, sessions: Arc<dyn SessionManager>) -> Self {
        let predefined_by_id: HashMap<u16, String> = config
            .predefined_topics
            .iter()
            .map(|t| (t.id, t.topic.clone()))
            .collect();
        let predefined_by_name = predefined_by_id
            .iter()
            .map(|(id, topic)| (topic.clone(), *id))
            .collect();
        Self {
            config,
            sessions,
            peers: HashMap::new(),
            predefined_by_id,
            predefined_by_name,
        }
    }

    pub(crate) fn predefined_topic(&self, id: u16) -> Option<&str> {
        self.predefined_by_id.get(&id).map(String::as_str)
    }

    pub(crate) fn predefined_id(&self, topic: &str) -> Option<u16> {
        self.predefined_by_name.get(topic).copied()
    }

    /// * return `Ok(None)` for a peer without state, whose traffic is ignored.
    /// * return `Err` for a peer still waiting for its session.
    pub(crate) fn session(
        &self,
        peer: &SocketAddr,
    ) -> Result<Option<Arc<dyn Session>>, MalformedPacket> {
        match self.peers.get(peer).map(|p| &p.phase) {
            None => Ok(None),
            Some(PeerPhase::Connecting) => {
                Err(MalformedPacket::new("connection not yet established"))
            }
            Some(PeerPhase::Connected(session)) => Ok(Some(Arc::clone(session))),
        }
    }

    /// Resolve the topic a PUBLISH names.
    pub(crate) fn resolve_topic(
        &self,
        peer: &SocketAddr,
        topic_id_type: TopicIdType,
        topic_id: u16,
    ) -> Option<String> {
        match topic_id_type {
            TopicIdType::Normal => self
                .peers
                .get(peer)
                .and_then(|p| p.topics.topic(topic_id))
                .map(str::to_owned),
            TopicIdType::Predefined => self.predefined_topic(topic_id).map(str::to_owned),
            TopicIdType::ShortName => short_name(topic_id.to_be_bytes()),
            TopicIdType::Reserved => None,
        }
    }

    /// Forget a peer and release its session. A graceful removal suppresses the will.
    pub(crate) fn remove_peer(&mut self, peer: &SocketAddr, graceful: bool) {
        if let Some(state) = self.peers.remove(peer) {
            debug!(
                "{} removed peer {} ({}), graceful {}",
                PROTOCOL_NAME, peer, state.client_id, graceful
            );
            if let PeerPhase::Connected(session) = state.phase {
                self.sessions.close_session(&session, !graceful);
            }
        }
    }

    /// Drop peers not heard from within the idle timeout.
    fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.config.idle_session_timeout();
        let idle: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for peer in &idle {
            info!("{} peer {} idle, dropping", PROTOCOL_NAME, peer);
            self.remove_peer(peer, false);
        }
        idle.len()
    }
}

pub(crate) fn short_name(bytes: [u8; 2]) -> Option<String> {
    String::from_utf8(bytes.to_vec()).ok()
}

/// What a listener sees while handling one message.
pub struct SnContext<'a> {
    pub(crate) state: &'a mut SnState,
    pub(crate) peer: SocketAddr,
    pub(crate) task: &'a Arc<ConnectionTask>,
}

impl SnContext<'_> {
    pub(crate) fn reply(&self, packet: SnPacket) -> SnFrame {
        SnFrame::new(self.peer, packet)
    }
}

//====================================================================================
//            MqttSnProtocol
//====================================================================================

pub struct MqttSnProtocol {
    state: SnState,
}

impl MqttSnProtocol {
    pub fn new(config: MqttSnConfig, sessions: Arc<dyn SessionManager>) -> Self {
        Self {
            state: SnState::new(config, sessions),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.state.peers.len()
    }

    pub fn is_connected(&self, peer: &SocketAddr) -> bool {
        matches!(
            self.state.peers.get(peer).map(|p| &p.phase),
            Some(PeerPhase::Connected(_))
        )
    }

    fn on_session_created(
        &mut self,
        peer: SocketAddr,
        result: Result<Arc<dyn Session>, SessionError>,
        task: &Arc<ConnectionTask>,
    ) {
        let state = match self.state.peers.get_mut(&peer) {
            Some(state) if matches!(state.phase, PeerPhase::Connecting) => state,
            _ => {
                if let Ok(session) = result {
                    self.state.sessions.close_session(&session, false);
                }
                return;
            }
        };
        match result {
            Ok(session) => {
                info!(
                    "{} session {} established for {}",
                    task.name(),
                    session.id(),
                    peer
                );
                state.phase = PeerPhase::Connected(session);
                task.push(Box::new(SnFrame::new(
                    peer,
                    SnPacket::ConnAck {
                        code: return_code::ACCEPTED,
                    },
                )));
                if let Some(interval) = state.keep_alive_interval() {
                    task.post_after(ProtocolEvent::KeepAliveCheck { peer: Some(peer) }, interval);
                }
            }
            Err(err) => {
                warn!("{} session refused for {}: {}", task.name(), peer, err);
                self.state.peers.remove(&peer);
                task.push(Box::new(SnFrame::new(
                    peer,
                    SnPacket::ConnAck {
                        code: return_code::NOT_SUPPORTED,
                    },
                )));
            }
        }
    }

    fn check_keep_alive(&mut self, peer: SocketAddr, task: &Arc<ConnectionTask>) {
        let state = match self.state.peers.get(&peer) {
            Some(state) if matches!(state.phase, PeerPhase::Connected(_)) => state,
            _ => return,
        };
        let interval = match state.keep_alive_interval() {
            Some(interval) => interval,
            None => return,
        };
        let idle = Instant::now().saturating_duration_since(state.last_seen);
        if idle >= interval {
            info!(
                "{} keep alive expired for {} after {:?}",
                task.name(),
                peer,
                idle
            );
            self.state.remove_peer(&peer, false);
        } else {
            task.post_after(
                ProtocolEvent::KeepAliveCheck { peer: Some(peer) },
                interval - idle,
            );
        }
    }

    fn deliver(&mut self, peer: SocketAddr, delivery: Delivery, task: &Arc<ConnectionTask>) {
        let predefined = self.state.predefined_id(&delivery.destination);
        let state = match self.state.peers.get_mut(&peer) {
            Some(state) if matches!(state.phase, PeerPhase::Connected(_)) => state,
            _ => {
                debug!("{} dropping delivery for departed {}", task.name(), peer);
                return;
            }
        };
        let topic = delivery.destination;
        let (topic_id_type, topic_id) = if let Some(id) = predefined {
            (TopicIdType::Predefined, id)
        } else if topic.len() == 2 {
            let b = topic.as_bytes();
            (TopicIdType::ShortName, u16::from_be_bytes([b[0], b[1]]))
        } else if let Some(id) = state.topics.id_of(&topic) {
            (TopicIdType::Normal, id)
        } else {
            match state.topics.register(&topic) {
                Some(id) => {
                    let msg_id = state.next_msg_id();
                    task.push(Box::new(SnFrame::new(
                        peer,
                        SnPacket::Register {
                            topic_id: id,
                            msg_id,
                            topic_name: topic.clone(),
                        },
                    )));
                    (TopicIdType::Normal, id)
                }
                None => {
                    warn!(
                        "{} topic registry full for {}, dropping message on {}",
                        task.name(),
                        peer,
                        topic
                    );
                    return;
                }
            }
        };
        let msg_id = if delivery.qos > 0 {
            state.next_msg_id()
        } else {
            0
        };
        let mut flags = Flags::with_qos(delivery.qos, topic_id_type);
        flags.retain = delivery.message.retain;
        let publish = SnPacket::Publish {
            flags,
            topic_id,
            msg_id,
            data: delivery.message.payload,
        };
        let frame = match delivery.completion {
            Some(cb) => SnFrame::new(peer, publish).with_completion(cb),
            None => SnFrame::new(peer, publish),
        };
        task.push(Box::new(frame));
    }
}

impl Protocol for MqttSnProtocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn process_packet(
        &mut self,
        packet: &mut Packet,
        task: &Arc<ConnectionTask>,
    ) -> Result<bool, MalformedPacket> {
        let peer = match packet.from_address() {
            Some(peer) => peer,
            None => {
                let limit = packet.limit();
                packet.set_position(limit);
                return Ok(true);
            }
        };
        let now = Instant::now();
        self.state.sweep(now);
        while packet.has_remaining() {
            let decoded = match SnPacket::decode(packet) {
                Ok(decoded) => decoded,
                Err(DecodeError::EndOfBuffer) => return Ok(false),
                Err(DecodeError::Malformed(msg)) => {
                    self.state.remove_peer(&peer, false);
                    return Err(MalformedPacket(msg));
                }
            };
            trace!("{} {} sent {:?}", task.name(), peer, decoded.msg_type());
            if let Some(state) = self.state.peers.get_mut(&peer) {
                state.last_seen = now;
            }
            let listener = SnListenerTable::get_listener(decoded.msg_type() as u8);
            let mut ctx = SnContext {
                state: &mut self.state,
                peer,
                task,
            };
            match listener.handle(decoded, &mut ctx) {
                Ok(Some(reply)) => task.push(Box::new(reply)),
                Ok(None) => {}
                Err(err) => {
                    self.state.remove_peer(&peer, false);
                    return Err(err);
                }
            }
        }
        Ok(true)
    }

    fn on_event(&mut self, event: ProtocolEvent, task: &Arc<ConnectionTask>) {
        match event {
            ProtocolEvent::SessionCreated {
                peer: Some(peer),
                result,
            } => self.on_session_created(peer, result, task),
            ProtocolEvent::Deliver {
                peer: Some(peer),
                delivery,
            } => self.deliver(peer, delivery, task),
            ProtocolEvent::KeepAliveCheck { peer: Some(peer) } => {
                self.check_keep_alive(peer, task)
            }
            other => warn!("{} event without peer: {:?}", task.name(), other),
        }
    }

    fn on_close(&mut self, task: &Arc<ConnectionTask>) {
        let peers: Vec<SocketAddr> = self.state.peers.keys().copied().collect();
        debug!("{} closing, releasing {} peers", task.name(), peers.len());
        for peer in &peers {
            self.state.remove_peer(peer, false);
        }
    }
}

pub struct MqttSnProtocolFactory {
    config: MqttSnConfig,
    sessions: Arc<dyn SessionManager>,
}

impl MqttSnProtocolFactory {
    pub fn new(config: MqttSnConfig, sessions: Arc<dyn SessionManager>) -> Self {
        Self { config, sessions }
    }
}

impl ProtocolFactory for MqttSnProtocolFactory {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }
    fn create(&self) -> Box<dyn Protocol> {
        Box::new(MqttSnProtocol::new(
            self.config.clone(),
            Arc::clone(&self.sessions),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PredefinedTopic;
    use crate::connection::test::detached_task;
    use crate::selector::SelectorRequest;
    use crate::session::memory::MemorySessionManager;
    use crossbeam_channel::Receiver;

    struct Harness {
        protocol: MqttSnProtocol,
        task: Arc<ConnectionTask>,
        requests: Receiver<SelectorRequest>,
        sessions: Arc<MemorySessionManager>,
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    impl Harness {
        fn new() -> Self {
            let mut config = MqttSnConfig::default();
            config.predefined_topics.push(PredefinedTopic {
                id: 40,
                topic: "sensors/temp".into(),
            });
            config.max_registered_size = 2;
            let sessions = Arc::new(MemorySessionManager::new());
            let (task, requests) = detached_task();
            Self {
                protocol: MqttSnProtocol::new(config, sessions.clone()),
                task,
                requests,
                sessions,
            }
        }

        fn feed(&mut self, from: SocketAddr, msg: SnPacket) -> Result<bool, MalformedPacket> {
            let mut buf = Packet::new(1500);
            msg.encode(&mut buf).unwrap();
            buf.flip();
            buf.set_from_address(Some(from));
            let result = self.protocol.process_packet(&mut buf, &self.task);
            self.pump();
            result
        }

        fn pump(&mut self) {
            while let Ok(request) = self.requests.try_recv() {
                if let SelectorRequest::Event {
                    event, delay: None, ..
                } = request
                {
                    self.protocol.on_event(event, &self.task);
                }
            }
        }

        fn sent(&mut self) -> Vec<(SocketAddr, SnPacket)> {
            let mut out = Vec::new();
            while let Some(frame) = self.task.pop_frame() {
                let to = frame.from_address().unwrap();
                let mut buf = Packet::new(1500);
                frame.pack_frame(&mut buf).unwrap();
                frame.complete();
                buf.flip();
                out.push((to, SnPacket::decode(&mut buf).unwrap()));
            }
            self.pump();
            out
        }

        fn connect(&mut self, from: SocketAddr, client_id: &str) {
            self.feed(
                from,
                SnPacket::Connect {
                    flags: Flags {
                        clean_session: true,
                        ..Flags::default()
                    },
                    protocol_id: packet::PROTOCOL_ID,
                    duration: 30,
                    client_id: client_id.into(),
                },
            )
            .unwrap();
            assert_eq!(
                self.sent(),
                vec![(from, SnPacket::ConnAck { code: return_code::ACCEPTED })]
            );
        }
    }

    #[test]
    fn test_search_gateway() {
        let mut h = Harness::new();
        h.feed(peer(1), SnPacket::SearchGw { radius: 1 }).unwrap();
        assert_eq!(h.sent(), vec![(peer(1), SnPacket::GwInfo { gateway_id: 1 })]);
        assert_eq!(h.protocol.peer_count(), 0);
    }

    #[test]
    fn test_connect_and_unknown_peers() {
        let mut h = Harness::new();
        h.connect(peer(1), "node1");
        assert!(h.protocol.is_connected(&peer(1)));
        assert_eq!(h.sessions.session_count(), 1);

        // traffic from a peer that never connected is ignored
        h.feed(peer(2), SnPacket::PingReq { client_id: None }).unwrap();
        assert!(h.sent().is_empty());
        h.feed(peer(1), SnPacket::PingReq { client_id: None }).unwrap();
        assert_eq!(h.sent(), vec![(peer(1), SnPacket::PingResp)]);
    }

    #[test]
    fn test_will_not_supported() {
        let mut h = Harness::new();
        h.feed(
            peer(1),
            SnPacket::Connect {
                flags: Flags {
                    will: true,
                    ..Flags::default()
                },
                protocol_id: packet::PROTOCOL_ID,
                duration: 0,
                client_id: "n".into(),
            },
        )
        .unwrap();
        assert_eq!(
            h.sent(),
            vec![(peer(1), SnPacket::ConnAck { code: return_code::NOT_SUPPORTED })]
        );
        assert_eq!(h.protocol.peer_count(), 0);
    }

    #[test]
    fn test_register_publish_subscribe() {
        let mut h = Harness::new();
        h.connect(peer(1), "pub");
        h.connect(peer(2), "sub");

        h.feed(
            peer(2),
            SnPacket::Subscribe {
                flags: Flags::with_qos(1, TopicIdType::Normal),
                msg_id: 1,
                topic: TopicRef::Name("home/+".into()),
            },
        )
        .unwrap();
        assert_eq!(
            h.sent(),
            vec![(
                peer(2),
                SnPacket::SubAck {
                    flags: Flags::with_qos(1, TopicIdType::Normal),
                    topic_id: 0,
                    msg_id: 1,
                    code: return_code::ACCEPTED
                }
            )]
        );

        h.feed(
            peer(1),
            SnPacket::Register {
                topic_id: 0,
                msg_id: 5,
                topic_name: "home/light".into(),
            },
        )
        .unwrap();
        assert_eq!(
            h.sent(),
            vec![(
                peer(1),
                SnPacket::RegAck {
                    topic_id: 1,
                    msg_id: 5,
                    code: return_code::ACCEPTED
                }
            )]
        );

        h.feed(
            peer(1),
            SnPacket::Publish {
                flags: Flags::with_qos(1, TopicIdType::Normal),
                topic_id: 1,
                msg_id: 6,
                data: b"on".to_vec(),
            },
        )
        .unwrap();
        // the PUBACK commits; the subscriber first learns the topic id, then gets the message
        let sent = h.sent();
        assert_eq!(
            sent[0],
            (
                peer(1),
                SnPacket::PubAck {
                    topic_id: 1,
                    msg_id: 6,
                    code: return_code::ACCEPTED
                }
            )
        );
        let sent = h.sent();
        match sent.as_slice() {
            [(to1, SnPacket::Register { topic_id, topic_name, .. }), (to2, SnPacket::Publish { topic_id: published, data, flags, .. })] =>
            {
                assert_eq!((*to1, *to2), (peer(2), peer(2)));
                assert_eq!(topic_name, "home/light");
                assert_eq!(topic_id, published);
                assert_eq!(data, b"on");
                assert_eq!(flags.qos, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_id_and_predefined() {
        let mut h = Harness::new();
        h.connect(peer(1), "n");
        h.feed(
            peer(1),
            SnPacket::Publish {
                flags: Flags::with_qos(1, TopicIdType::Normal),
                topic_id: 77,
                msg_id: 2,
                data: vec![],
            },
        )
        .unwrap();
        assert_eq!(
            h.sent(),
            vec![(
                peer(1),
                SnPacket::PubAck {
                    topic_id: 77,
                    msg_id: 2,
                    code: return_code::INVALID_TOPIC_ID
                }
            )]
        );

        h.feed(
            peer(1),
            SnPacket::Publish {
                flags: Flags::with_qos(0, TopicIdType::Predefined),
                topic_id: 40,
                msg_id: 0,
                data: b"21.5".to_vec(),
            },
        )
        .unwrap();
        let stored = h.sessions.destination("sensors/temp").unwrap().messages();
        assert_eq!(stored[0].payload, b"21.5");
    }

    #[test]
    fn test_qos2_exchange() {
        let mut h = Harness::new();
        h.connect(peer(1), "n");
        h.feed(
            peer(1),
            SnPacket::Publish {
                flags: Flags::with_qos(2, TopicIdType::ShortName),
                topic_id: u16::from_be_bytes(*b"ab"),
                msg_id: 9,
                data: b"x".to_vec(),
            },
        )
        .unwrap();
        assert_eq!(h.sent(), vec![(peer(1), SnPacket::PubRec(9))]);
        assert!(h.sessions.destination("ab").is_none());
        h.feed(peer(1), SnPacket::PubRel(9)).unwrap();
        assert_eq!(h.sent(), vec![(peer(1), SnPacket::PubComp(9))]);
        assert_eq!(h.sessions.destination("ab").unwrap().messages().len(), 1);
    }

    #[test]
    fn test_malformed_drops_only_that_peer() {
        let mut h = Harness::new();
        h.connect(peer(1), "a");
        h.connect(peer(2), "b");
        let mut buf = Packet::from_slice(&[3, 0x10, 0]);
        buf.set_from_address(Some(peer(1)));
        assert!(h.protocol.process_packet(&mut buf, &h.task).is_err());
        assert!(!h.protocol.is_connected(&peer(1)));
        assert!(h.protocol.is_connected(&peer(2)));
        assert!(!h.task.is_closed());
    }

    #[test]
    fn test_disconnect() {
        let mut h = Harness::new();
        h.connect(peer(1), "a");
        h.feed(peer(1), SnPacket::Disconnect { duration: None }).unwrap();
        assert_eq!(
            h.sent(),
            vec![(peer(1), SnPacket::Disconnect { duration: None })]
        );
        assert_eq!(h.protocol.peer_count(), 0);
        assert_eq!(h.sessions.session_count(), 0);
    }

    #[test]
    fn test_topic_registry_limit() {
        let mut topics = TopicRegistry::new(2);
        assert_eq!(topics.register("a"), Some(1));
        assert_eq!(topics.register("b"), Some(2));
        assert_eq!(topics.register("a"), Some(1));
        assert_eq!(topics.register("c"), None);
        topics.remove(1);
        assert_eq!(topics.register("c"), Some(3));
        assert_eq!(topics.topic(3), Some("c"));
        assert_eq!(topics.len(), 2);
    }
}
