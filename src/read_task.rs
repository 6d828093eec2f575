use log::{debug, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{TcpConfig, UdpConfig};
use crate::connection::ConnectionTask;
use crate::endpoint::{EndPoint, ReadStatus};
use crate::packet::Packet;
use crate::protocol::Protocol;

/// What the selector loop should do after a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Data was processed; the connection stays registered.
    Continue,
    /// Nothing left to read this cycle.
    Drained,
    /// Too many fragmented reads: pause read interest for the duration, then re-register.
    Backoff(Duration),
    Close,
}

//====================================================================================
//            ReadTask
//====================================================================================

/// `ReadTask` drains a stream endpoint into one reusable packet and hands it to the protocol.
///
/// Bytes of a partial frame stay in the packet until later reads complete it. Each read whose bytes could not
/// all be decoded counts as an underflow; once the count exceeds `fragmentation_limit` the next readiness
/// turns into a back-off instead of a read, so a client trickling tiny fragments cannot monopolise the loop.
pub struct ReadTask {
    packet: Packet,
    underflow: u32,
    fragmentation_limit: u32,
    read_delay: Duration,
}

impl ReadTask {
    /// * `read_delay` - back-off duration; zero disables the back-off.
    pub fn new(buffer_size: usize, fragmentation_limit: u32, read_delay: Duration) -> Self {
        Self {
            packet: Packet::new(buffer_size),
            underflow: 0,
            fragmentation_limit,
            read_delay,
        }
    }

    pub fn from_config(config: &TcpConfig) -> Self {
        Self::new(
            config.server_read_buffer_size,
            config.fragmentation_limit,
            config.read_delay(),
        )
    }

    pub fn underflow_count(&self) -> u32 {
        self.underflow
    }

    /// Unconsumed bytes carried over to the next read.
    pub fn buffered(&self) -> usize {
        self.packet.position()
    }

    pub fn read(
        &mut self,
        endpoint: &mut dyn EndPoint,
        protocol: &mut dyn Protocol,
        task: &Arc<ConnectionTask>,
    ) -> ReadOutcome {
        if !self.read_delay.is_zero() && self.underflow > self.fragmentation_limit {
            self.underflow = 0;
            return ReadOutcome::Backoff(self.read_delay);
        }
        let bytes = match endpoint.read_packet(&mut self.packet) {
            Ok(ReadStatus::Data(n)) => n,
            Ok(ReadStatus::Empty) => return ReadOutcome::Drained,
            Ok(ReadStatus::Closed) => {
                debug!("{} end of stream", endpoint.name());
                return ReadOutcome::Close;
            }
            Err(err) => {
                debug!("{} read failed: {}", endpoint.name(), err);
                return ReadOutcome::Close;
            }
        };
        trace!("{} read {} bytes", endpoint.name(), bytes);
        task.touch();

        self.packet.flip();
        match protocol.process_packet(&mut self.packet, task) {
            Ok(consumed_all) => {
                if !consumed_all && self.packet.has_remaining() {
                    self.underflow += 1;
                }
            }
            Err(err) => {
                warn!("{} {}, closing", endpoint.name(), err);
                return ReadOutcome::Close;
            }
        }
        self.retain_residual();

        if self.packet.position() == self.packet.capacity() {
            warn!(
                "{} frame exceeds the {} byte read buffer, closing",
                endpoint.name(),
                self.packet.capacity()
            );
            return ReadOutcome::Close;
        }
        if task.is_closed() {
            return ReadOutcome::Close;
        }
        ReadOutcome::Continue
    }

    // Back to fill mode, keeping unconsumed bytes at the front.
    fn retain_residual(&mut self) {
        let (position, limit) = (self.packet.position(), self.packet.limit());
        if position == limit {
            self.packet.clear();
        } else if position != 0 {
            self.packet.compact();
        } else {
            let capacity = self.packet.capacity();
            self.packet.set_limit(capacity);
            self.packet.set_position(limit);
        }
    }
}

//====================================================================================
//            UdpReadTask
//====================================================================================

struct OutstandingPacket {
    packet: Packet, // fill mode: residual bytes at the front
    created: Instant,
}

/// Partially decoded datagrams per peer. Entries older than the reuse timeout are swept before every read.
pub struct ReassemblyTable {
    entries: HashMap<SocketAddr, OutstandingPacket>,
    timeout: Duration,
}

impl ReassemblyTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.entries.contains_key(peer)
    }

    /// Drop entries older than the timeout. return number dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries.retain(|peer, entry| {
            let keep = now.saturating_duration_since(entry.created) <= timeout;
            if !keep {
                trace!("dropping stale fragment from {}", peer);
            }
            keep
        });
        before - self.entries.len()
    }

    fn take(&mut self, peer: &SocketAddr) -> Option<Packet> {
        self.entries.remove(peer).map(|e| e.packet)
    }

    fn insert(&mut self, peer: SocketAddr, packet: Packet, now: Instant) {
        self.entries.insert(
            peer,
            OutstandingPacket {
                packet,
                created: now,
            },
        );
    }
}

/// `UdpReadTask` receives one datagram per read. A datagram from a peer with an outstanding fragment is
/// appended to it before decoding; bytes left over after decoding are kept for the next datagram from that peer.
pub struct UdpReadTask {
    packet: Packet,
    table: ReassemblyTable,
    max_datagrams: usize,
}

impl UdpReadTask {
    pub fn new(buffer_size: usize, reuse_timeout: Duration, max_datagrams: usize) -> Self {
        Self {
            packet: Packet::new(buffer_size),
            table: ReassemblyTable::new(reuse_timeout),
            max_datagrams: max_datagrams.max(1),
        }
    }

    pub fn from_config(config: &UdpConfig) -> Self {
        Self::new(
            config.buffer_size,
            config.packet_reuse_timeout(),
            config.max_datagrams_per_cycle,
        )
    }

    pub fn table(&self) -> &ReassemblyTable {
        &self.table
    }

    /// Read datagrams until the socket is empty or the per-cycle limit is hit.
    pub fn read_available(
        &mut self,
        endpoint: &mut dyn EndPoint,
        protocol: &mut dyn Protocol,
        task: &Arc<ConnectionTask>,
        now: Instant,
    ) -> ReadOutcome {
        for _ in 0..self.max_datagrams {
            match self.read(endpoint, protocol, task, now) {
                ReadOutcome::Continue => {}
                other => return other,
            }
        }
        ReadOutcome::Continue
    }

    /// Receive and process one datagram. Errors never close the endpoint.
    pub fn read(
        &mut self,
        endpoint: &mut dyn EndPoint,
        protocol: &mut dyn Protocol,
        task: &Arc<ConnectionTask>,
        now: Instant,
    ) -> ReadOutcome {
        self.table.sweep(now);
        self.packet.clear();
        self.packet.set_from_address(None);
        match endpoint.read_packet(&mut self.packet) {
            Ok(ReadStatus::Data(_)) => {}
            Ok(ReadStatus::Empty) | Ok(ReadStatus::Closed) => return ReadOutcome::Drained,
            Err(err) => {
                debug!("{} receive failed: {}", endpoint.name(), err);
                return ReadOutcome::Drained;
            }
        }
        let from = match self.packet.from_address() {
            Some(from) => from,
            None => return ReadOutcome::Continue,
        };
        task.touch();
        self.packet.flip();

        let leftover = match self.table.take(&from) {
            Some(mut pending) => {
                if pending.put_packet(&mut self.packet).is_ok() {
                    pending.flip();
                    pending.set_from_address(Some(from));
                    decode(&mut pending, protocol, task, from)
                } else {
                    debug!("fragment from {} overflows reassembly, dropped", from);
                    decode(&mut self.packet, protocol, task, from)
                }
            }
            None => decode(&mut self.packet, protocol, task, from),
        };
        if let Some(bytes) = leftover {
            let mut residual = Packet::new(self.packet.capacity().max(bytes.len()));
            // residual capacity always fits bytes
            let _ = residual.put_slice(&bytes);
            residual.set_from_address(Some(from));
            self.table.insert(from, residual, now);
        }
        ReadOutcome::Continue
    }
}

/// return the undecoded tail when the packet ended in a partial frame.
fn decode(
    packet: &mut Packet,
    protocol: &mut dyn Protocol,
    task: &Arc<ConnectionTask>,
    from: SocketAddr,
) -> Option<Vec<u8>> {
    match protocol.process_packet(packet, task) {
        Ok(true) => None,
        Ok(false) if packet.has_remaining() => Some(packet.remaining_slice().to_vec()),
        Ok(false) => None,
        Err(err) => {
            warn!("dropping datagram from {}: {}", from, err);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::connection::test::detached_task;
    use crate::endpoint::test::MockEndPoint;
    use crate::protocol::MalformedPacket;

    /// Frames are one length byte followed by that many bytes; a zero length is malformed.
    pub(crate) struct LengthPrefixed {
        pub frames: Vec<Vec<u8>>,
        pub peers: Vec<Option<SocketAddr>>,
    }

    impl LengthPrefixed {
        pub fn new() -> Self {
            Self {
                frames: Vec::new(),
                peers: Vec::new(),
            }
        }
    }

    impl Protocol for LengthPrefixed {
        fn name(&self) -> &'static str {
            "length-prefixed"
        }
        fn process_packet(
            &mut self,
            packet: &mut Packet,
            _task: &Arc<ConnectionTask>,
        ) -> Result<bool, MalformedPacket> {
            while packet.has_remaining() {
                let len = packet.remaining_slice()[0] as usize;
                if len == 0 {
                    return Err(MalformedPacket::new("zero length"));
                }
                if packet.remaining() < len + 1 {
                    return Ok(false);
                }
                packet.advance(1).unwrap();
                let frame = packet.get_slice(len).unwrap().to_vec();
                self.frames.push(frame);
                self.peers.push(packet.from_address());
            }
            Ok(true)
        }
    }

    fn stream_of(frames: &[&[u8]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for f in frames {
            bytes.push(f.len() as u8);
            bytes.extend_from_slice(f);
        }
        bytes
    }

    fn decode_in_chunks(bytes: &[u8], chunk: usize) -> Vec<Vec<u8>> {
        let (task, _rx) = detached_task();
        let mut endpoint = MockEndPoint::new();
        for c in bytes.chunks(chunk) {
            endpoint.chunks.push_back(c.to_vec());
        }
        let mut protocol = LengthPrefixed::new();
        let mut reader = ReadTask::new(64, 1000, Duration::ZERO);
        while !endpoint.chunks.is_empty() {
            assert_eq!(
                reader.read(&mut endpoint, &mut protocol, &task),
                ReadOutcome::Continue
            );
        }
        assert_eq!(reader.buffered(), 0);
        protocol.frames
    }

    #[test]
    fn test_decoding_is_chunk_size_independent() {
        let bytes = stream_of(&[b"hello", b"w", b"a longer frame of bytes", b"xy"]);
        let expected = decode_in_chunks(&bytes, bytes.len());
        assert_eq!(expected.len(), 4);
        for chunk in 1..bytes.len() {
            assert_eq!(decode_in_chunks(&bytes, chunk), expected, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_backoff_after_fragmentation_limit() {
        let (task, _rx) = detached_task();
        let mut endpoint = MockEndPoint::new();
        let bytes = stream_of(&[b"0123456789"]);
        for c in bytes.chunks(1) {
            endpoint.chunks.push_back(c.to_vec());
        }
        let mut protocol = LengthPrefixed::new();
        let delay = Duration::from_millis(100);
        let mut reader = ReadTask::new(64, 2, delay);

        // the frame trickles in one byte per read, each read underflows
        for _ in 0..3 {
            assert_eq!(reader.read(&mut endpoint, &mut protocol, &task), ReadOutcome::Continue);
        }
        assert_eq!(reader.underflow_count(), 3);
        assert_eq!(
            reader.read(&mut endpoint, &mut protocol, &task),
            ReadOutcome::Backoff(delay)
        );
        assert_eq!(reader.underflow_count(), 0);
        while !endpoint.chunks.is_empty() {
            reader.read(&mut endpoint, &mut protocol, &task);
        }
        assert_eq!(protocol.frames, vec![b"0123456789".to_vec()]);
    }

    #[test]
    fn test_close_on_eof_malformed_and_oversized() {
        let (task, _rx) = detached_task();
        let mut protocol = LengthPrefixed::new();

        let mut endpoint = MockEndPoint::new();
        endpoint.eof = true;
        let mut reader = ReadTask::new(8, 5, Duration::ZERO);
        assert_eq!(reader.read(&mut endpoint, &mut protocol, &task), ReadOutcome::Close);

        let mut endpoint = MockEndPoint::new();
        endpoint.chunks.push_back(vec![0]);
        let mut reader = ReadTask::new(8, 5, Duration::ZERO);
        assert_eq!(reader.read(&mut endpoint, &mut protocol, &task), ReadOutcome::Close);

        let mut endpoint = MockEndPoint::new();
        endpoint.chunks.push_back(vec![20, 1, 2, 3, 4, 5, 6, 7]);
        let mut reader = ReadTask::new(8, 5, Duration::ZERO);
        assert_eq!(reader.read(&mut endpoint, &mut protocol, &task), ReadOutcome::Close);
    }

    #[test]
    fn test_empty_read_keeps_buffer() {
        let (task, _rx) = detached_task();
        let mut protocol = LengthPrefixed::new();
        let mut endpoint = MockEndPoint::new();
        endpoint.chunks.push_back(vec![3, b'a']);
        let mut reader = ReadTask::new(16, 5, Duration::ZERO);
        assert_eq!(reader.read(&mut endpoint, &mut protocol, &task), ReadOutcome::Continue);
        assert_eq!(reader.read(&mut endpoint, &mut protocol, &task), ReadOutcome::Drained);
        assert_eq!(reader.buffered(), 2);
        endpoint.chunks.push_back(vec![b'b', b'c']);
        reader.read(&mut endpoint, &mut protocol, &task);
        assert_eq!(protocol.frames, vec![b"abc".to_vec()]);
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_udp_reassembly_independent_of_parts() {
        let frame = stream_of(&[b"reassembled datagram"]);
        for k in 1..=frame.len() {
            let (task, _rx) = detached_task();
            let mut endpoint = MockEndPoint::new();
            endpoint.peer = Some(peer(5000));
            let size = (frame.len() + k - 1) / k;
            for part in frame.chunks(size) {
                endpoint.chunks.push_back(part.to_vec());
            }
            let mut protocol = LengthPrefixed::new();
            let mut reader = UdpReadTask::new(256, Duration::from_secs(1), 8);
            let now = Instant::now();
            while !endpoint.chunks.is_empty() {
                reader.read(&mut endpoint, &mut protocol, &task, now);
            }
            assert_eq!(protocol.frames, vec![b"reassembled datagram".to_vec()], "k = {k}");
            assert_eq!(protocol.peers, vec![Some(peer(5000))]);
            assert!(reader.table().is_empty());
        }
    }

    #[test]
    fn test_udp_late_fragment_is_not_merged() {
        let (task, _rx) = detached_task();
        let mut endpoint = MockEndPoint::new();
        endpoint.peer = Some(peer(5001));
        let mut protocol = LengthPrefixed::new();
        let mut reader = UdpReadTask::new(256, Duration::from_millis(1000), 8);
        let start = Instant::now();

        endpoint.chunks.push_back(vec![6, b'a', b'b', b'c']);
        reader.read(&mut endpoint, &mut protocol, &task, start);
        assert!(reader.table().contains(&peer(5001)));

        endpoint.chunks.push_back(vec![b'd', b'e', b'f']);
        reader.read(&mut endpoint, &mut protocol, &task, start + Duration::from_millis(1500));
        assert!(protocol.frames.iter().all(|f| f != b"abcdef"));
    }

    #[test]
    fn test_udp_peers_are_kept_apart() {
        let (task, _rx) = detached_task();
        let mut protocol = LengthPrefixed::new();
        let mut reader = UdpReadTask::new(256, Duration::from_secs(1), 8);
        let now = Instant::now();

        let mut a = MockEndPoint::new();
        a.peer = Some(peer(6000));
        a.chunks.push_back(vec![4, b'a', b'a']);
        reader.read(&mut a, &mut protocol, &task, now);

        let mut b = MockEndPoint::new();
        b.peer = Some(peer(6001));
        b.chunks.push_back(vec![2, b'b', b'b']);
        reader.read(&mut b, &mut protocol, &task, now);

        a.chunks.push_back(vec![b'a', b'a']);
        reader.read(&mut a, &mut protocol, &task, now);

        assert_eq!(protocol.frames, vec![b"bb".to_vec(), b"aaaa".to_vec()]);
        assert_eq!(protocol.peers, vec![Some(peer(6001)), Some(peer(6000))]);
    }
}
