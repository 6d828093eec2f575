//! MQTT 3.1 / 3.1.1 over stream transports.
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::MqttConfig;
use crate::connection::ConnectionTask;
use crate::frame::ServerPacket;
use crate::packet::{Packet, PacketError};
use crate::protocol::{MalformedPacket, Protocol, ProtocolEvent, ProtocolFactory};
use crate::session::{Message, Session, SessionManager};

pub mod codec;
pub mod listeners;
pub mod packet;

use codec::DecodeError;
use listeners::ListenerTable;
pub use packet::{connack, MqttPacket, PacketType, Publish};

pub const PROTOCOL_NAME: &str = "mqtt";

//====================================================================================
//            MqttFrame
//====================================================================================

/// An outbound MQTT packet plus the callback to run once it is on the wire.
pub struct MqttFrame {
    packet: MqttPacket,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl MqttFrame {
    pub fn new(packet: MqttPacket) -> Self {
        Self {
            packet,
            on_complete: None,
        }
    }
    pub fn with_completion(mut self, on_complete: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }
    pub fn packet(&self) -> &MqttPacket {
        &self.packet
    }
}

impl ServerPacket for MqttFrame {
    fn pack_frame(&self, packet: &mut Packet) -> Result<usize, PacketError> {
        self.packet.encode(packet)
    }
    fn complete(self: Box<Self>) {
        if let Some(cb) = self.on_complete {
            cb();
        }
    }
}

impl std::fmt::Debug for MqttFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MqttFrame({:?})", self.packet)
    }
}

//====================================================================================
//            connection state
//====================================================================================

pub(crate) enum Phase {
    Idle,
    /// CONNECT accepted, session creation in flight.
    Connecting,
    Connected(Arc<dyn Session>),
    /// CONNECT or session creation refused; waiting for the delayed close.
    Refused,
}

/// Per-connection MQTT state, only touched on the owning selector loop.
pub struct MqttState {
    pub(crate) config: MqttConfig,
    pub(crate) sessions: Arc<dyn SessionManager>,
    pub(crate) phase: Phase,
    pub(crate) client_id: String,
    pub(crate) keep_alive: Duration,
    /// Set by DISCONNECT; suppresses the will.
    pub(crate) graceful: bool,
    /// QoS 2 publishes received but not yet released, by packet id.
    pub(crate) inbound_qos2: HashMap<u16, (String, Message)>,
    next_packet_id: u16,
}

impl MqttState {
    fn new(config: MqttConfig, sessions: Arc<dyn SessionManager>) -> Self {
        Self {
            config,
            sessions,
            phase: Phase::Idle,
            client_id: String::new(),
            keep_alive: Duration::ZERO,
            graceful: false,
            inbound_qos2: HashMap::new(),
            next_packet_id: 0,
        }
    }

    pub(crate) fn session(&self) -> Result<Arc<dyn Session>, MalformedPacket> {
        match &self.phase {
            Phase::Connected(session) => Ok(Arc::clone(session)),
            _ => Err(MalformedPacket::new("connection not yet established")),
        }
    }

    /// Packet ids for outbound QoS 1/2 deliveries, skipping 0.
    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        self.next_packet_id
    }
}

/// What a listener sees while handling one packet.
pub struct MqttContext<'a> {
    pub(crate) state: &'a mut MqttState,
    pub(crate) task: &'a Arc<ConnectionTask>,
}

//====================================================================================
//            MqttProtocol
//====================================================================================

pub struct MqttProtocol {
    state: MqttState,
}

impl MqttProtocol {
    pub fn new(config: MqttConfig, sessions: Arc<dyn SessionManager>) -> Self {
        Self {
            state: MqttState::new(config, sessions),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state.phase, Phase::Connected(_))
    }

    /// The client id in use, generated when the client sent none.
    pub fn client_id(&self) -> &str {
        &self.state.client_id
    }

    fn on_session_created(
        &mut self,
        result: Result<Arc<dyn Session>, crate::session::SessionError>,
        task: &Arc<ConnectionTask>,
    ) {
        if !matches!(self.state.phase, Phase::Connecting) {
            if let Ok(session) = result {
                self.state.sessions.close_session(&session, false);
            }
            return;
        }
        match result {
            Ok(session) => {
                let restored = session.is_restored();
                info!(
                    "{} session {} established, restored {}",
                    task.name(),
                    session.id(),
                    restored
                );
                self.state.phase = Phase::Connected(session);
                task.push(Box::new(MqttFrame::new(MqttPacket::ConnAck {
                    session_present: restored,
                    code: connack::ACCEPTED,
                })));
                if let Some(interval) = self.keep_alive_interval() {
                    task.post_after(ProtocolEvent::KeepAliveCheck { peer: None }, interval);
                }
            }
            Err(err) => {
                warn!("{} session refused: {}", task.name(), err);
                self.state.phase = Phase::Refused;
                let delay = self.state.config.close_delay();
                let weak = Arc::downgrade(task);
                let frame = MqttFrame::new(MqttPacket::ConnAck {
                    session_present: false,
                    code: connack::BAD_CREDENTIALS,
                })
                .with_completion(move || {
                    if let Some(task) = weak.upgrade() {
                        task.schedule_close(delay);
                    }
                });
                task.push(Box::new(frame));
            }
        }
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        if self.state.keep_alive.is_zero() {
            None
        } else {
            Some(self.state.keep_alive * 3 / 2)
        }
    }

    fn check_keep_alive(&mut self, task: &Arc<ConnectionTask>) {
        let interval = match self.keep_alive_interval() {
            Some(interval) if self.is_connected() => interval,
            _ => return,
        };
        let idle = task.idle_for(Instant::now());
        if idle >= interval {
            info!(
                "{} keep alive expired after {:?} idle",
                task.name(),
                idle
            );
            task.close();
        } else {
            task.post_after(ProtocolEvent::KeepAliveCheck { peer: None }, interval - idle);
        }
    }

    fn deliver(&mut self, delivery: crate::session::Delivery, task: &Arc<ConnectionTask>) {
        if !self.is_connected() {
            debug!(
                "{} dropping delivery for {}",
                task.name(),
                delivery.destination
            );
            return;
        }
        let packet_id = if delivery.qos > 0 {
            Some(self.state.next_packet_id())
        } else {
            None
        };
        let publish = MqttPacket::Publish(Publish {
            dup: false,
            qos: delivery.qos,
            retain: delivery.message.retain,
            topic: delivery.destination,
            packet_id,
            payload: delivery.message.payload,
        });
        let frame = match delivery.completion {
            Some(cb) => MqttFrame::new(publish).with_completion(cb),
            None => MqttFrame::new(publish),
        };
        task.push(Box::new(frame));
    }
}

impl Protocol for MqttProtocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn process_packet(
        &mut self,
        packet: &mut Packet,
        task: &Arc<ConnectionTask>,
    ) -> Result<bool, MalformedPacket> {
        while packet.has_remaining() {
            let decoded = match MqttPacket::decode(packet) {
                Ok(decoded) => decoded,
                Err(DecodeError::EndOfBuffer) => return Ok(false),
                Err(DecodeError::Malformed(msg)) => return Err(MalformedPacket(msg)),
            };
            trace!("{} received {:?}", task.name(), decoded.packet_type());
            let listener = ListenerTable::get_listener(decoded.packet_type() as u8);
            let mut ctx = MqttContext {
                state: &mut self.state,
                task,
            };
            if let Some(reply) = listener.handle(decoded, &mut ctx)? {
                task.push(Box::new(reply));
            }
            if task.is_closed() {
                // nothing after DISCONNECT is processed
                let limit = packet.limit();
                packet.set_position(limit);
            }
        }
        Ok(true)
    }

    fn on_event(&mut self, event: ProtocolEvent, task: &Arc<ConnectionTask>) {
        match event {
            ProtocolEvent::SessionCreated { result, .. } => self.on_session_created(result, task),
            ProtocolEvent::Deliver { delivery, .. } => self.deliver(delivery, task),
            ProtocolEvent::KeepAliveCheck { .. } => self.check_keep_alive(task),
        }
    }

    fn on_close(&mut self, task: &Arc<ConnectionTask>) {
        let phase = std::mem::replace(&mut self.state.phase, Phase::Idle);
        if let Phase::Connected(session) = phase {
            debug!(
                "{} releasing session {}, graceful {}",
                task.name(),
                session.id(),
                self.state.graceful
            );
            self.state
                .sessions
                .close_session(&session, !self.state.graceful);
        }
        self.state.inbound_qos2.clear();
    }
}

pub struct MqttProtocolFactory {
    config: MqttConfig,
    sessions: Arc<dyn SessionManager>,
}

impl MqttProtocolFactory {
    pub fn new(config: MqttConfig, sessions: Arc<dyn SessionManager>) -> Self {
        Self { config, sessions }
    }
}

impl ProtocolFactory for MqttProtocolFactory {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }
    fn create(&self) -> Box<dyn Protocol> {
        Box::new(MqttProtocol::new(
            self.config.clone(),
            Arc::clone(&self.sessions),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::packet::{Connect, LastWill};
    use super::*;
    use crate::connection::test::detached_task;
    use crate::selector::SelectorRequest;
    use crate::session::memory::MemorySessionManager;
    use crate::session::Delivery;
    use crossbeam_channel::Receiver;
    use std::collections::HashMap as Map;

    struct Harness {
        protocol: MqttProtocol,
        task: Arc<ConnectionTask>,
        requests: Receiver<SelectorRequest>,
        sessions: Arc<MemorySessionManager>,
    }

    impl Harness {
        fn new(config: MqttConfig, sessions: MemorySessionManager) -> Self {
            let sessions = Arc::new(sessions);
            let (task, requests) = detached_task();
            let protocol = MqttProtocol::new(config, sessions.clone());
            Self {
                protocol,
                task,
                requests,
                sessions,
            }
        }

        fn standard() -> Self {
            Self::new(MqttConfig::default(), MemorySessionManager::new())
        }

        fn feed(&mut self, packets: &[MqttPacket]) -> Result<bool, MalformedPacket> {
            let mut buf = Packet::new(4096);
            for p in packets {
                p.encode(&mut buf).unwrap();
            }
            buf.flip();
            self.protocol.process_packet(&mut buf, &self.task)
        }

        /// Hand posted events back to the protocol, as the loop would. Returns close-after delays seen.
        fn pump(&mut self) -> Vec<Duration> {
            let mut closes = Vec::new();
            while let Ok(request) = self.requests.try_recv() {
                match request {
                    SelectorRequest::Event { event, delay: None, .. } => {
                        self.protocol.on_event(event, &self.task)
                    }
                    SelectorRequest::CloseAfter { delay, .. } => closes.push(delay),
                    _ => {}
                }
            }
            closes
        }

        /// Pop queued frames, completing each as the write pipeline would.
        fn sent(&mut self) -> Vec<MqttPacket> {
            let mut out = Vec::new();
            while let Some(frame) = self.task.pop_frame() {
                let mut buf = Packet::new(4096);
                frame.pack_frame(&mut buf).unwrap();
                frame.complete();
                buf.flip();
                out.push(MqttPacket::decode(&mut buf).unwrap());
            }
            out
        }
    }

    fn connect(level: u8, client_id: &str, clean: bool) -> MqttPacket {
        MqttPacket::Connect(Box::new(Connect {
            protocol_name: if level == 3 { "MQIsdp" } else { "MQTT" }.to_owned(),
            protocol_level: level,
            clean_session: clean,
            keep_alive: 30,
            client_id: client_id.to_owned(),
            will: None,
            username: None,
            password: None,
        }))
    }

    fn conn_ack(code: u8) -> MqttPacket {
        MqttPacket::ConnAck {
            session_present: false,
            code,
        }
    }

    #[test]
    fn test_connect_accepted() {
        let mut h = Harness::standard();
        assert_eq!(h.feed(&[connect(4, "abc123", true)]), Ok(true));
        h.pump();
        assert_eq!(h.sent(), vec![conn_ack(connack::ACCEPTED)]);
        assert!(h.protocol.is_connected());
        assert!(!h.task.is_closed());
        assert_eq!(h.sessions.session_count(), 1);
    }

    #[test]
    fn test_empty_client_id() {
        let mut h = Harness::standard();
        h.feed(&[connect(4, "", true)]).unwrap();
        h.pump();
        assert_eq!(h.sent(), vec![conn_ack(connack::ACCEPTED)]);
        assert_eq!(h.protocol.client_id().len(), 32);

        let mut h = Harness::standard();
        h.feed(&[connect(4, "", false)]).unwrap();
        assert_eq!(h.sent(), vec![conn_ack(connack::IDENTIFIER_REJECTED)]);
        assert!(!h.task.is_closed());
        assert!(h.pump().is_empty());
    }

    #[test]
    fn test_long_client_id_on_31_rejected() {
        let mut h = Harness::standard();
        h.feed(&[connect(3, &"a".repeat(30), true)]).unwrap();
        assert_eq!(h.sent(), vec![conn_ack(connack::IDENTIFIER_REJECTED)]);
        assert!(!h.task.is_closed());
        assert_eq!(h.sessions.session_count(), 0);
    }

    #[test]
    fn test_protocol_level_mismatch_closes_after_delay() {
        let mut h = Harness::standard();
        let mut packet = connect(4, "abc", true);
        if let MqttPacket::Connect(c) = &mut packet {
            c.protocol_level = 3;
        }
        h.feed(&[packet]).unwrap();
        assert_eq!(
            h.sent(),
            vec![conn_ack(connack::UNACCEPTABLE_PROTOCOL_VERSION)]
        );
        assert_eq!(h.pump(), vec![MqttConfig::default().close_delay()]);
    }

    #[test]
    fn test_connect_after_version_refusal_is_malformed() {
        let mut h = Harness::standard();
        let mut packet = connect(4, "abc", true);
        if let MqttPacket::Connect(c) = &mut packet {
            c.protocol_level = 3;
        }
        h.feed(&[packet]).unwrap();
        h.sent();
        h.pump();

        assert!(h.feed(&[connect(4, "abc", true)]).is_err());
        h.pump();
        assert!(h.sent().is_empty());
        assert!(!h.protocol.is_connected());
        assert_eq!(h.sessions.session_count(), 0);
    }

    #[test]
    fn test_second_connect_is_malformed() {
        let mut h = Harness::standard();
        h.feed(&[connect(4, "abc", true)]).unwrap();
        assert!(h.feed(&[connect(4, "abc", true)]).is_err());
    }

    #[test]
    fn test_bad_credentials() {
        let mut creds = Map::new();
        creds.insert("user".to_owned(), "secret".to_owned());
        let mut h = Harness::new(
            MqttConfig::default(),
            MemorySessionManager::with_credentials(creds),
        );
        let mut packet = connect(4, "abc", true);
        if let MqttPacket::Connect(c) = &mut packet {
            c.username = Some("user".into());
            c.password = Some(b"wrong".to_vec());
        }
        h.feed(&[packet]).unwrap();
        h.pump();
        assert_eq!(h.sent(), vec![conn_ack(connack::BAD_CREDENTIALS)]);
        assert_eq!(h.pump(), vec![MqttConfig::default().close_delay()]);
        assert!(!h.protocol.is_connected());
    }

    #[test]
    fn test_requires_session() {
        let mut h = Harness::standard();
        let subscribe = MqttPacket::Subscribe {
            packet_id: 1,
            filters: vec![("a".into(), 0)],
        };
        assert!(h.feed(&[subscribe]).is_err());
    }

    #[test]
    fn test_publish_subscribe_loop() {
        let mut h = Harness::standard();
        h.feed(&[
            connect(4, "abc", true),
        ])
        .unwrap();
        h.pump();
        h.sent();
        h.feed(&[MqttPacket::Subscribe {
            packet_id: 5,
            filters: vec![("a/+".into(), 1), ("bad/#/x".into(), 0)],
        }])
        .unwrap();
        assert_eq!(
            h.sent(),
            vec![MqttPacket::SubAck {
                packet_id: 5,
                codes: vec![1, 0x80]
            }]
        );

        // QoS 1 publish: the PUBACK commits, the commit routes back to us
        h.feed(&[MqttPacket::Publish(Publish {
            dup: false,
            qos: 1,
            retain: false,
            topic: "a/b".into(),
            packet_id: Some(9),
            payload: b"hi".to_vec(),
        })])
        .unwrap();
        assert_eq!(h.sent(), vec![MqttPacket::PubAck(9)]);
        h.pump();
        match h.sent().as_slice() {
            [MqttPacket::Publish(p)] => {
                assert_eq!(p.topic, "a/b");
                assert_eq!(p.qos, 1);
                assert_eq!(p.packet_id, Some(1));
                assert_eq!(p.payload, b"hi");
            }
            other => panic!("unexpected {:?}", other),
        }

        h.feed(&[MqttPacket::Unsubscribe {
            packet_id: 6,
            filters: vec!["a/+".into()],
        }])
        .unwrap();
        assert_eq!(h.sent(), vec![MqttPacket::UnsubAck(6)]);
    }

    #[test]
    fn test_qos2_held_until_release() {
        let mut h = Harness::standard();
        h.feed(&[connect(4, "abc", true)]).unwrap();
        h.pump();
        h.sent();
        let publish = MqttPacket::Publish(Publish {
            dup: false,
            qos: 2,
            retain: false,
            topic: "q".into(),
            packet_id: Some(3),
            payload: b"x".to_vec(),
        });
        h.feed(&[publish]).unwrap();
        assert_eq!(h.sent(), vec![MqttPacket::PubRec(3)]);
        assert!(h
            .sessions
            .destination("q")
            .map_or(true, |d| d.messages().is_empty()));

        h.feed(&[MqttPacket::PubRel(3)]).unwrap();
        assert_eq!(h.sent(), vec![MqttPacket::PubComp(3)]);
        let stored = h.sessions.destination("q").unwrap().messages();
        assert_eq!(stored.len(), 1);

        // a repeated PUBREL is answered without storing again
        h.feed(&[MqttPacket::PubRel(3)]).unwrap();
        assert_eq!(h.sent(), vec![MqttPacket::PubComp(3)]);
        assert_eq!(h.sessions.destination("q").unwrap().messages().len(), 1);
    }

    #[test]
    fn test_reserved_topics_dropped() {
        let mut h = Harness::standard();
        h.feed(&[connect(4, "abc", true)]).unwrap();
        h.pump();
        h.sent();
        h.feed(&[MqttPacket::Publish(Publish {
            dup: false,
            qos: 1,
            retain: false,
            topic: "$SYS/x".into(),
            packet_id: Some(2),
            payload: vec![],
        })])
        .unwrap();
        assert_eq!(h.sent(), vec![MqttPacket::PubAck(2)]);
        assert!(h.sessions.destination("$SYS/x").is_none());
    }

    #[test]
    fn test_ping_and_disconnect() {
        let mut h = Harness::standard();
        h.feed(&[connect(4, "abc", true)]).unwrap();
        h.pump();
        h.sent();
        assert_eq!(h.feed(&[MqttPacket::PingReq, MqttPacket::Disconnect, MqttPacket::PingReq]), Ok(true));
        assert!(h.task.is_closed());
        // the PINGRESP was dropped by the close along with anything after DISCONNECT
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_will_published_on_abrupt_close() {
        let mut h = Harness::standard();
        let mut packet = connect(4, "dev", true);
        if let MqttPacket::Connect(c) = &mut packet {
            c.will = Some(LastWill {
                topic: "status/dev".into(),
                message: b"offline".to_vec(),
                qos: 0,
                retain: false,
            });
        }
        h.feed(&[packet]).unwrap();
        h.pump();
        h.protocol.on_close(&h.task);
        let stored = h.sessions.destination("status/dev").unwrap().messages();
        assert_eq!(stored[0].payload, b"offline");
        assert_eq!(h.sessions.session_count(), 0);
    }

    #[test]
    fn test_delivery_completion_runs_after_send() {
        let mut h = Harness::standard();
        h.feed(&[connect(4, "abc", true)]).unwrap();
        h.pump();
        h.sent();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = done.clone();
        let mut delivery = Delivery::new("t", Message::new(b"m".to_vec(), 0), 0);
        delivery.completion = Some(Box::new(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst)
        }));
        h.protocol.on_event(
            ProtocolEvent::Deliver {
                peer: None,
                delivery,
            },
            &h.task,
        );
        assert!(!done.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(h.sent().len(), 1);
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
    }
}
