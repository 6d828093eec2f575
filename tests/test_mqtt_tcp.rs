use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use brokerio::config::{BrokerConfig, TcpConfig};
use brokerio::protocol::mqtt::codec::DecodeError;
use brokerio::protocol::mqtt::packet::Connect;
use brokerio::protocol::mqtt::{connack, MqttPacket, MqttProtocolFactory, Publish};
use brokerio::session::memory::MemorySessionManager;
use brokerio::{Packet, SelectorPool, TcpEndPointServer};

struct Broker {
    server: TcpEndPointServer,
    sessions: Arc<MemorySessionManager>,
    _pool: SelectorPool,
}

fn start_broker(tcp: TcpConfig) -> Broker {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = BrokerConfig::default();
    let pool = SelectorPool::new(&config.selector).unwrap();
    let sessions = Arc::new(MemorySessionManager::new());
    let factory = Arc::new(MqttProtocolFactory::new(config.mqtt.clone(), sessions.clone()));
    let server = TcpEndPointServer::start(&pool, "127.0.0.1:0", factory, &tcp).unwrap();
    Broker {
        server,
        sessions,
        _pool: pool,
    }
}

struct Client {
    stream: TcpStream,
    inbound: Packet,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        Self {
            stream,
            inbound: Packet::new(4096),
        }
    }

    fn send(&mut self, packet: &MqttPacket) {
        let mut buf = Packet::new(4096);
        packet.encode(&mut buf).unwrap();
        buf.flip();
        self.stream.write_all(buf.remaining_slice()).unwrap();
    }

    /// Send one byte per write so the broker sees every frame in fragments.
    fn send_trickled(&mut self, packet: &MqttPacket) {
        let mut buf = Packet::new(4096);
        packet.encode(&mut buf).unwrap();
        buf.flip();
        for b in buf.remaining_slice() {
            self.stream.write_all(&[*b]).unwrap();
            self.stream.flush().unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// `None` once the broker closed the connection.
    fn recv(&mut self) -> Option<MqttPacket> {
        loop {
            self.inbound.flip();
            match MqttPacket::decode(&mut self.inbound) {
                Ok(packet) => {
                    self.inbound.compact();
                    return Some(packet);
                }
                Err(DecodeError::EndOfBuffer) => self.inbound.compact(),
                Err(err) => panic!("broker sent a malformed frame: {err}"),
            }
            let n = match self.stream.read(self.inbound.writable_slice()) {
                Ok(0) => return None,
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => return None,
                Err(err) => panic!("read failed: {err}"),
            };
            let position = self.inbound.position() + n;
            self.inbound.set_position(position);
        }
    }
}

fn connect_packet(name: &str, level: u8, client_id: &str) -> MqttPacket {
    MqttPacket::Connect(Box::new(Connect {
        protocol_name: name.to_owned(),
        protocol_level: level,
        clean_session: true,
        keep_alive: 60,
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
    let broker = start_broker(TcpConfig::default());
    let mut client = Client::connect(broker.server.local_addr());
    client.send(&connect_packet("MQTT", 4, "client1"));
    assert_eq!(client.recv(), Some(conn_ack(connack::ACCEPTED)));

    client.send(&MqttPacket::PingReq);
    assert_eq!(client.recv(), Some(MqttPacket::PingResp));
    assert_eq!(broker.sessions.session_count(), 1);

    client.send(&MqttPacket::Disconnect);
    assert_eq!(client.recv(), None);
}

#[test]
fn test_connect_survives_fragmentation() {
    let broker = start_broker(TcpConfig {
        server_read_buffer_size: 64,
        ..TcpConfig::default()
    });
    let mut client = Client::connect(broker.server.local_addr());
    client.send_trickled(&connect_packet("MQTT", 4, "slowclient"));
    assert_eq!(client.recv(), Some(conn_ack(connack::ACCEPTED)));
}

#[test]
fn test_long_client_id_rejected_on_v31() {
    let broker = start_broker(TcpConfig::default());
    let mut client = Client::connect(broker.server.local_addr());
    let client_id = "a".repeat(30);
    client.send(&connect_packet("MQIsdp", 3, &client_id));
    assert_eq!(client.recv(), Some(conn_ack(connack::IDENTIFIER_REJECTED)));

    // the connection stays open after the rejection
    client.send(&connect_packet("MQIsdp", 3, "short"));
    assert_eq!(client.recv(), Some(conn_ack(connack::ACCEPTED)));
}

#[test]
fn test_protocol_level_mismatch_closes() {
    let broker = start_broker(TcpConfig::default());
    let mut client = Client::connect(broker.server.local_addr());
    client.send(&connect_packet("MQTT", 3, "client2"));
    assert_eq!(
        client.recv(),
        Some(conn_ack(connack::UNACCEPTABLE_PROTOCOL_VERSION))
    );
    assert_eq!(client.recv(), None);
    assert_eq!(broker.sessions.session_count(), 0);
}

#[test]
fn test_second_connect_closes() {
    let broker = start_broker(TcpConfig::default());
    let mut client = Client::connect(broker.server.local_addr());
    client.send(&connect_packet("MQTT", 4, "twice"));
    assert_eq!(client.recv(), Some(conn_ack(connack::ACCEPTED)));

    client.send(&connect_packet("MQTT", 4, "twice"));
    assert_eq!(client.recv(), None);
}

#[test]
fn test_publish_reaches_subscriber() {
    let broker = start_broker(TcpConfig::default());
    let mut subscriber = Client::connect(broker.server.local_addr());
    subscriber.send(&connect_packet("MQTT", 4, "sub"));
    assert_eq!(subscriber.recv(), Some(conn_ack(connack::ACCEPTED)));
    subscriber.send(&MqttPacket::Subscribe {
        packet_id: 1,
        filters: vec![("home/#".to_owned(), 1)],
    });
    assert_eq!(
        subscriber.recv(),
        Some(MqttPacket::SubAck {
            packet_id: 1,
            codes: vec![1]
        })
    );

    let mut publisher = Client::connect(broker.server.local_addr());
    publisher.send(&connect_packet("MQTT", 4, "pub"));
    assert_eq!(publisher.recv(), Some(conn_ack(connack::ACCEPTED)));
    publisher.send(&MqttPacket::Publish(Publish {
        dup: false,
        qos: 1,
        retain: false,
        topic: "home/kitchen".to_owned(),
        packet_id: Some(9),
        payload: b"21.5".to_vec(),
    }));
    assert_eq!(publisher.recv(), Some(MqttPacket::PubAck(9)));

    match subscriber.recv() {
        Some(MqttPacket::Publish(publish)) => {
            assert_eq!(publish.topic, "home/kitchen");
            assert_eq!(publish.payload, b"21.5");
            assert_eq!(publish.qos, 1);
            assert!(publish.packet_id.is_some());
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}
