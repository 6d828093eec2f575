use log::warn;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

use crate::packet::Packet;

/// Outcome of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Number of bytes appended at the packet's position.
    Data(usize),
    /// Nothing available right now.
    Empty,
    /// Orderly end of stream.
    Closed,
}

/// `EndPoint` is the transport a connection reads from and writes to.
/// Both calls are non-blocking. Registration and close are handled by `ConnectionTask`.
pub trait EndPoint: Send {
    /// Read into `packet` at its position, advancing it by the bytes read.
    /// Datagram endpoints also set the packet's from-address to the sender, and drop a datagram
    /// that fills the whole window since it may have been truncated.
    fn read_packet(&mut self, packet: &mut Packet) -> std::io::Result<ReadStatus>;

    /// Write the remaining bytes of `packet`, advancing it by the bytes written.
    /// * return bytes written, 0 on would-block.
    fn send_packet(&mut self, packet: &mut Packet) -> std::io::Result<usize>;

    fn remote_address(&self) -> Option<SocketAddr>;

    fn name(&self) -> &str;
}

pub struct TcpEndPoint {
    stream: TcpStream,
    remote: Option<SocketAddr>,
    name: String,
}

impl TcpEndPoint {
    /// `stream` must already be non-blocking.
    pub fn new(stream: TcpStream) -> Self {
        let remote = stream.peer_addr().ok();
        let name = match remote {
            Some(addr) => format!("tcp://{addr}"),
            None => "tcp://unknown".to_owned(),
        };
        Self {
            stream,
            remote,
            name,
        }
    }
    pub fn socket(&self) -> &TcpStream {
        &self.stream
    }
}

impl EndPoint for TcpEndPoint {
    fn read_packet(&mut self, packet: &mut Packet) -> std::io::Result<ReadStatus> {
        if !packet.has_remaining() {
            return Ok(ReadStatus::Empty);
        }
        loop {
            match self.stream.read(packet.writable_slice()) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    packet.set_position(packet.position() + n);
                    return Ok(ReadStatus::Data(n));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Empty),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn send_packet(&mut self, packet: &mut Packet) -> std::io::Result<usize> {
        if !packet.has_remaining() {
            return Ok(0);
        }
        loop {
            match self.stream.write(packet.remaining_slice()) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    packet.set_position(packet.position() + n);
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct UdpEndPoint {
    socket: UdpSocket,
    name: String,
}

impl UdpEndPoint {
    /// `socket` must already be non-blocking.
    pub fn new(socket: UdpSocket) -> Self {
        let name = match socket.local_addr() {
            Ok(addr) => format!("udp://{addr}"),
            Err(_) => "udp://unknown".to_owned(),
        };
        Self { socket, name }
    }
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl EndPoint for UdpEndPoint {
    fn read_packet(&mut self, packet: &mut Packet) -> std::io::Result<ReadStatus> {
        loop {
            let room = packet.remaining();
            match self.socket.recv_from(packet.writable_slice()) {
                // a datagram that fills the buffer may have been cut short.
                Ok((n, from)) if n == room => {
                    warn!("{} dropped datagram from {} filling all {} bytes", self.name, from, room);
                    continue;
                }
                Ok((n, from)) => {
                    packet.set_position(packet.position() + n);
                    packet.set_from_address(Some(from));
                    return Ok(ReadStatus::Data(n));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Empty),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn send_packet(&mut self, packet: &mut Packet) -> std::io::Result<usize> {
        let to = packet.from_address().ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidInput, "datagram without destination")
        })?;
        match self.socket.send_to(packet.remaining_slice(), to) {
            Ok(n) => {
                packet.set_position(packet.position() + n);
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted endpoint: reads pop queued chunks, writes accept up to `write_budget` bytes per call.
    pub(crate) struct MockEndPoint {
        pub chunks: VecDeque<Vec<u8>>,
        pub peer: Option<SocketAddr>,
        pub eof: bool,
        pub written: Vec<u8>,
        pub write_calls: usize,
        pub write_budget: usize,
        pub fail_writes: bool,
    }

    impl MockEndPoint {
        pub fn new() -> Self {
            Self {
                chunks: VecDeque::new(),
                peer: None,
                eof: false,
                written: Vec::new(),
                write_calls: 0,
                write_budget: usize::MAX,
                fail_writes: false,
            }
        }
    }

    impl EndPoint for MockEndPoint {
        fn read_packet(&mut self, packet: &mut Packet) -> std::io::Result<ReadStatus> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    packet
                        .put_slice(&chunk)
                        .map_err(|_| std::io::Error::new(ErrorKind::Other, "mock overflow"))?;
                    packet.set_from_address(self.peer);
                    Ok(ReadStatus::Data(chunk.len()))
                }
                None if self.eof => Ok(ReadStatus::Closed),
                None => Ok(ReadStatus::Empty),
            }
        }
        fn send_packet(&mut self, packet: &mut Packet) -> std::io::Result<usize> {
            self.write_calls += 1;
            if self.fail_writes {
                return Err(ErrorKind::ConnectionReset.into());
            }
            let n = packet.remaining().min(self.write_budget);
            self.written.extend_from_slice(&packet.remaining_slice()[..n]);
            packet.set_position(packet.position() + n);
            Ok(n)
        }
        fn remote_address(&self) -> Option<SocketAddr> {
            self.peer
        }
        fn name(&self) -> &str {
            "mock"
        }
    }

    #[test]
    fn test_udp_endpoint_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut endpoint = UdpEndPoint::new(server);

        let mut packet = Packet::new(64);
        assert_eq!(endpoint.read_packet(&mut packet).unwrap(), ReadStatus::Empty);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"hello", server_addr).unwrap();
        let timer = crate::utils::Timer::new_millis(1000);
        let status = loop {
            let status = endpoint.read_packet(&mut packet).unwrap();
            if status != ReadStatus::Empty || timer.expired() {
                break status;
            }
        };
        assert_eq!(status, ReadStatus::Data(5));
        assert_eq!(packet.from_address(), Some(client.local_addr().unwrap()));

        packet.flip();
        assert_eq!(endpoint.send_packet(&mut packet).unwrap(), 5);
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_udp_endpoint_drops_oversized_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut endpoint = UdpEndPoint::new(server);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&[7u8; 32], server_addr).unwrap();
        client.send_to(b"fits", server_addr).unwrap();

        let mut packet = Packet::new(16);
        let timer = crate::utils::Timer::new_millis(1000);
        let status = loop {
            let status = endpoint.read_packet(&mut packet).unwrap();
            if status != ReadStatus::Empty || timer.expired() {
                break status;
            }
        };
        assert_eq!(status, ReadStatus::Data(4));
        packet.flip();
        assert_eq!(packet.remaining_slice(), b"fits");
    }
}
