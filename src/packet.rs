use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer overflow")]
    Overflow,
    #[error("buffer underflow")]
    Underflow,
}

/// `Packet` is a reusable byte buffer with a read/write cursor.
///
/// Invariant: `0 <= position <= limit <= capacity`.
/// * In fill mode bytes are written at `position` up to `limit` (normally `capacity`).
/// * After `flip()` the written bytes lie in `[position, limit)` and can be consumed.
///
/// A packet carries an optional peer address for connectionless transports. It is owned by exactly one
/// pipeline and moved, never shared, between threads.
pub struct Packet {
    bytes: Vec<u8>,
    position: usize,
    limit: usize,
    from_address: Option<SocketAddr>,
}

impl Packet {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity],
            position: 0,
            limit: capacity,
            from_address: None,
        }
    }

    /// A flipped packet holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec(),
            position: 0,
            limit: data.len(),
            from_address: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }
    pub fn position(&self) -> usize {
        self.position
    }
    pub fn limit(&self) -> usize {
        self.limit
    }
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.limit);
        self.position = position.min(self.limit);
    }
    pub fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit <= self.capacity());
        self.limit = limit.min(self.capacity());
        if self.position > self.limit {
            self.position = self.limit;
        }
    }

    /// Ready for filling from the start.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Switch from filling to consuming: `limit = position; position = 0`.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Slide unconsumed bytes `[position, limit)` to the start and switch back to filling after them.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.bytes.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = self.capacity();
    }

    /// The bytes between `position` and `limit`.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.bytes[self.position..self.limit]
    }

    /// The writable window between `position` and `limit`.
    pub fn writable_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[self.position..self.limit]
    }

    pub fn advance(&mut self, count: usize) -> Result<(), PacketError> {
        if count > self.remaining() {
            return Err(PacketError::Underflow);
        }
        self.position += count;
        Ok(())
    }

    pub fn put_u8(&mut self, val: u8) -> Result<(), PacketError> {
        self.put_slice(&[val])
    }
    pub fn put_u16(&mut self, val: u16) -> Result<(), PacketError> {
        self.put_slice(&val.to_be_bytes())
    }
    /// Fails without writing anything when `data` does not fit.
    pub fn put_slice(&mut self, data: &[u8]) -> Result<(), PacketError> {
        if data.len() > self.remaining() {
            return Err(PacketError::Overflow);
        }
        self.bytes[self.position..self.position + data.len()].copy_from_slice(data);
        self.position += data.len();
        Ok(())
    }
    /// Append the remaining bytes of `other`, consuming them.
    pub fn put_packet(&mut self, other: &mut Packet) -> Result<(), PacketError> {
        self.put_slice(other.remaining_slice())?;
        other.position = other.limit;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, PacketError> {
        let val = *self
            .remaining_slice()
            .first()
            .ok_or(PacketError::Underflow)?;
        self.position += 1;
        Ok(val)
    }
    pub fn get_u16(&mut self) -> Result<u16, PacketError> {
        let bytes = self.get_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
    pub fn get_slice(&mut self, len: usize) -> Result<&[u8], PacketError> {
        if len > self.remaining() {
            return Err(PacketError::Underflow);
        }
        let start = self.position;
        self.position += len;
        Ok(&self.bytes[start..start + len])
    }

    pub fn from_address(&self) -> Option<SocketAddr> {
        self.from_address
    }
    pub fn set_from_address(&mut self, addr: Option<SocketAddr>) {
        self.from_address = addr;
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity())
            .field("from", &self.from_address)
            .finish()
    }
}
