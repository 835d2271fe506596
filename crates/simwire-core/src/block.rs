//! Blocks: the self-contained field groups a message body is made of.
//!
//! Each block owns its byte layout and nothing else. Decoding reads from a
//! `&mut &[u8]` cursor that is advanced past the block; every primitive read
//! checks the remaining length first, so a short buffer becomes
//! [`WireError::Truncated`] instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::WireError;

/// A fixed- or length-prefixed field group inside a message body.
///
/// `to_bytes` must write exactly `length()` bytes. Packet encoding checks
/// this and reports [`WireError::LengthMismatch`] when a block lies.
pub trait Block: Sized {
    /// Encoded size of the block with its current field values.
    fn length(&self) -> usize;

    /// Decode one block at the cursor, advancing it.
    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError>;

    /// Append the encoded block.
    fn to_bytes(&self, buf: &mut BytesMut);
}

// ── Primitive readers ─────────────────────────────────────────────────────────

fn ensure(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16_le(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn read_u32_le(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn read_bytes(buf: &mut &[u8], len: usize) -> Result<Bytes, WireError> {
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

// ── Variable-length fields ────────────────────────────────────────────────────

/// Raw bytes behind a 1-byte length prefix. At most 255 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variable1(Bytes);

impl Variable1 {
    pub const MAX_LEN: usize = u8::MAX as usize;

    pub fn new(data: impl Into<Bytes>) -> Result<Self, WireError> {
        let data = data.into();
        if data.len() > Self::MAX_LEN {
            return Err(WireError::FieldTooLong {
                field: "Variable1",
                len: data.len(),
                max: Self::MAX_LEN,
            });
        }
        Ok(Self(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Block for Variable1 {
    fn length(&self) -> usize {
        1 + self.0.len()
    }

    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError> {
        let len = read_u8(buf)? as usize;
        Ok(Self(read_bytes(buf, len)?))
    }

    fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u8(self.0.len() as u8);
        buf.put_slice(&self.0);
    }
}

/// Raw bytes behind a 2-byte little-endian length prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variable2(Bytes);

impl Variable2 {
    pub const MAX_LEN: usize = u16::MAX as usize;

    pub fn new(data: impl Into<Bytes>) -> Result<Self, WireError> {
        let data = data.into();
        if data.len() > Self::MAX_LEN {
            return Err(WireError::FieldTooLong {
                field: "Variable2",
                len: data.len(),
                max: Self::MAX_LEN,
            });
        }
        Ok(Self(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Block for Variable2 {
    fn length(&self) -> usize {
        2 + self.0.len()
    }

    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError> {
        let len = read_u16_le(buf)? as usize;
        Ok(Self(read_bytes(buf, len)?))
    }

    fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.0.len() as u16);
        buf.put_slice(&self.0);
    }
}

// ── Repeated blocks ───────────────────────────────────────────────────────────

/// Encoded size of a variable-count block list: count byte plus each block.
pub fn repeated_length<B: Block>(blocks: &[B]) -> usize {
    1 + blocks.iter().map(Block::length).sum::<usize>()
}

/// Decode a variable-count block list (1-byte count, then the blocks).
pub fn read_repeated<B: Block>(buf: &mut &[u8]) -> Result<Vec<B>, WireError> {
    let count = read_u8(buf)? as usize;
    (0..count).map(|_| B::from_bytes(buf)).collect()
}

/// Append a variable-count block list. Callers keep `blocks.len() <= 255`.
pub fn write_repeated<B: Block>(blocks: &[B], buf: &mut BytesMut) {
    buf.put_u8(blocks.len() as u8);
    for block in blocks {
        block.to_bytes(buf);
    }
}
