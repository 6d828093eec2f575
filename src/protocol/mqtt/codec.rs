use thiserror::Error;

use crate::packet::{Packet, PacketError};

/// Largest value of the variable-length remaining-length field (four bytes).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends inside a frame; retry when more bytes arrived.
    #[error("end of buffer")]
    EndOfBuffer,
    #[error("{0}")]
    Malformed(String),
}

impl DecodeError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        DecodeError::Malformed(msg.into())
    }
}

/// Parsed fixed header: first byte, remaining length and the header's own size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub first: u8,
    pub remaining_length: usize,
    pub header_len: usize,
}

impl FixedHeader {
    pub fn opcode(&self) -> u8 {
        self.first >> 4
    }
    pub fn flags(&self) -> u8 {
        self.first & 0x0F
    }
    pub fn frame_len(&self) -> usize {
        self.header_len + self.remaining_length
    }
}

pub fn decode_fixed_header(bytes: &[u8]) -> Result<FixedHeader, DecodeError> {
    let first = *bytes.first().ok_or(DecodeError::EndOfBuffer)?;
    let mut remaining_length = 0usize;
    let mut multiplier = 1usize;
    for i in 0..4 {
        let byte = *bytes.get(1 + i).ok_or(DecodeError::EndOfBuffer)?;
        remaining_length += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(FixedHeader {
                first,
                remaining_length,
                header_len: 2 + i,
            });
        }
        multiplier *= 128;
    }
    Err(DecodeError::malformed("remaining length exceeds four bytes"))
}

pub fn remaining_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Write a fixed header plus body, or nothing when it does not fit.
pub fn put_frame(packet: &mut Packet, first: u8, body: &[u8]) -> Result<usize, PacketError> {
    if body.len() > MAX_REMAINING_LENGTH {
        return Err(PacketError::Overflow);
    }
    let total = 1 + remaining_length_size(body.len()) + body.len();
    if total > packet.remaining() {
        return Err(PacketError::Overflow);
    }
    packet.put_u8(first)?;
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.put_u8(byte)?;
        if len == 0 {
            break;
        }
    }
    packet.put_slice(body)?;
    Ok(total)
}

/// Cursor over a frame body. Running past the end is a malformed frame, since the fixed header
/// promised the whole body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::malformed("frame shorter than its fields"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
    /// Two byte length prefixed bytes.
    pub fn read_binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }
    /// Two byte length prefixed UTF-8.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_binary()?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::malformed("string is not valid UTF-8"))?;
        if text.contains('\0') {
            return Err(DecodeError::malformed("string contains U+0000"));
        }
        Ok(text.to_owned())
    }
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Body builder used by the encoders.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn u8(&mut self, val: u8) -> &mut Self {
        self.buf.push(val);
        self
    }
    pub fn u16(&mut self, val: u16) -> &mut Self {
        self.buf.extend_from_slice(&val.to_be_bytes());
        self
    }
    pub fn bytes(&mut self, val: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(val);
        self
    }
    pub fn binary(&mut self, val: &[u8]) -> &mut Self {
        self.u16(val.len().min(u16::MAX as usize) as u16);
        self.bytes(&val[..val.len().min(u16::MAX as usize)])
    }
    pub fn string(&mut self, val: &str) -> &mut Self {
        self.binary(val.as_bytes())
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}
