use std::net::SocketAddr;

use crate::packet::{Packet, PacketError};

/// `ServerPacket` is implemented by every outbound protocol frame.
///
/// The write pipeline owns a frame from `push` until `complete` consumes it. `complete` takes the boxed frame by
/// value, so it runs at most once; it runs only after the bytes produced by `pack_frame` were handed to the
/// socket in full. Frames dropped because their connection closed are never completed.
pub trait ServerPacket: Send {
    /// Serialize into `packet` at its position.
    /// * return the number of bytes written, or `PacketError::Overflow` when the frame does not fit.
    ///   On overflow the caller rolls the position back, so partial writes are allowed.
    fn pack_frame(&self, packet: &mut Packet) -> Result<usize, PacketError>;

    /// Called once the frame's bytes are on the wire.
    fn complete(self: Box<Self>) {}

    /// Destination of the frame on connectionless transports.
    fn from_address(&self) -> Option<SocketAddr> {
        None
    }
    fn set_from_address(&mut self, _addr: Option<SocketAddr>) {}
}

/// A pre-encoded frame with an optional completion callback. Handy for tests and raw replies.
pub struct RawFrame {
    bytes: Vec<u8>,
    address: Option<SocketAddr>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl RawFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            address: None,
            on_complete: None,
        }
    }
    pub fn with_completion(mut self, on_complete: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl ServerPacket for RawFrame {
    fn pack_frame(&self, packet: &mut Packet) -> Result<usize, PacketError> {
        packet.put_slice(&self.bytes)?;
        Ok(self.bytes.len())
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
