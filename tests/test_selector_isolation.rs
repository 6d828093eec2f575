use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use brokerio::config::{SelectorConfig, TcpConfig};
use brokerio::{
    ConnectionTask, MalformedPacket, Packet, Protocol, ProtocolFactory, RawFrame, SelectorPool,
    TcpEndPointServer,
};

/// Echoes input back, but panics when it sees 0xFF.
struct Brittle;

impl Protocol for Brittle {
    fn name(&self) -> &'static str {
        "brittle"
    }

    fn process_packet(
        &mut self,
        packet: &mut Packet,
        task: &Arc<ConnectionTask>,
    ) -> Result<bool, MalformedPacket> {
        let bytes = packet.remaining_slice().to_vec();
        if bytes.contains(&0xFF) {
            panic!("cannot handle 0xFF");
        }
        packet.set_position(packet.limit());
        task.push(Box::new(RawFrame::new(bytes)));
        Ok(true)
    }
}

struct BrittleFactory;

impl ProtocolFactory for BrittleFactory {
    fn name(&self) -> &'static str {
        "brittle"
    }
    fn create(&self) -> Box<dyn Protocol> {
        Box::new(Brittle)
    }
}

fn connect(server: &TcpEndPointServer) -> TcpStream {
    let stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream
}

fn echo(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).unwrap();
    let mut buf = vec![0u8; bytes.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, bytes);
}

#[test]
fn test_protocol_panic_closes_only_its_connection() {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = SelectorPool::new(&SelectorConfig {
        selector_threads: 1,
        ..SelectorConfig::default()
    })
    .unwrap();
    let server = TcpEndPointServer::start(
        &pool,
        "127.0.0.1:0",
        Arc::new(BrittleFactory),
        &TcpConfig::default(),
    )
    .unwrap();

    let mut good = connect(&server);
    echo(&mut good, b"a");

    let mut bad = connect(&server);
    bad.write_all(&[0xFF]).unwrap();
    let mut buf = [0u8; 1];
    match bad.read(&mut buf) {
        Ok(0) => {}
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {}
        other => panic!("expected the broken connection to close, got {other:?}"),
    }

    // the shared loop keeps serving the listener and the other connection.
    echo(&mut good, b"still here");
    let mut late = connect(&server);
    echo(&mut late, b"b");
    assert!(pool.handles()[0].is_running());
}
