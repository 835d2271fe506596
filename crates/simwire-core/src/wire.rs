//! Legacy simulator UDP framing.
//!
//! Every datagram on the simulator circuit starts with the same 6-byte
//! prefix, followed by optional extra header bytes, the message id, the
//! message body, and an optional trailing ack list:
//!
//! ```text
//! [flags:1][sequence:4 BE][extra_len:1][extra]
//! [message id: 1 | 2 | 4 bytes][body]
//! [ack:4 BE]*[ack_count:1]            (only when HAS_ACKS is set)
//! ```
//!
//! Flag bits and message id encodings are pinned to the legacy protocol so
//! real simulators can read what we write. Changing anything here is a
//! breaking change on the wire.

use std::fmt;
use std::ops::BitOr;

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Fixed prefix ─────────────────────────────────────────────────────────────

/// The fixed 6-byte prefix at the start of every datagram.
///
/// The sequence number is stored as raw big-endian bytes so the struct has
/// no alignment requirement and can be read straight out of a receive buffer.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct WirePrefix {
    pub flags: u8,
    pub sequence: [u8; 4],
    pub extra_len: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(WirePrefix, [u8; 6]);

/// Size of [`WirePrefix`] on the wire.
pub const PREFIX_LEN: usize = 6;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Capacity of a receive buffer. Larger than any datagram a simulator sends.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Upper bound for a zero-decoded region. Refuses expansion bombs.
pub const MAX_DECODED_SIZE: usize = MAX_PACKET_SIZE * 8;

/// Maximum number of acks that fit in the trailing ack block (1-byte count).
pub const MAX_APPENDED_ACKS: usize = 255;

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Per-packet flag bits carried in the first byte of the prefix.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const ZERO_CODED: PacketFlags = PacketFlags(0x80);
    pub const RELIABLE: PacketFlags = PacketFlags(0x40);
    pub const RESENT: PacketFlags = PacketFlags(0x20);
    pub const HAS_ACKS: PacketFlags = PacketFlags(0x10);

    /// Bits 0-3 are not assigned by the protocol.
    const KNOWN: u8 = 0xF0;

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    /// Interpret a raw flags byte. Unassigned bits are dropped.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        PacketFlags(bits & Self::KNOWN)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: PacketFlags, value: bool) {
        if value {
            self.insert(other)
        } else {
            self.remove(other)
        }
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::ZERO_CODED) {
            names.push("ZERO_CODED");
        }
        if self.contains(Self::RELIABLE) {
            names.push("RELIABLE");
        }
        if self.contains(Self::RESENT) {
            names.push("RESENT");
        }
        if self.contains(Self::HAS_ACKS) {
            names.push("HAS_ACKS");
        }
        write!(f, "PacketFlags({})", names.join(" | "))
    }
}

// ── Message ids ───────────────────────────────────────────────────────────────

/// Frequency class of a message. Determines the width of its id on the wire.
///
/// Frequent messages get short ids: High ids are a single byte, Medium ids
/// are escaped with one 0xFF, Low ids with two. Fixed ids are the handful of
/// transport-level messages living at 0xFFFFFFxx.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    High,
    Medium,
    Low,
    Fixed,
}

impl Frequency {
    /// Number of bytes the message id occupies for this class.
    pub const fn id_len(self) -> usize {
        match self {
            Frequency::High => 1,
            Frequency::Medium => 2,
            Frequency::Low | Frequency::Fixed => 4,
        }
    }
}

/// A message number qualified by its frequency class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub frequency: Frequency,
    pub number: u16,
}

impl MessageId {
    pub const fn high(number: u8) -> Self {
        Self { frequency: Frequency::High, number: number as u16 }
    }

    pub const fn medium(number: u8) -> Self {
        Self { frequency: Frequency::Medium, number: number as u16 }
    }

    pub const fn low(number: u16) -> Self {
        Self { frequency: Frequency::Low, number }
    }

    pub const fn fixed(number: u8) -> Self {
        Self { frequency: Frequency::Fixed, number: number as u16 }
    }

    pub const fn len(self) -> usize {
        self.frequency.id_len()
    }

    /// Whether this id can be written without colliding with a longer escape.
    pub fn is_encodable(self) -> bool {
        match self.frequency {
            Frequency::High | Frequency::Medium => self.number < 0xFF,
            Frequency::Low => self.number < 0xFF00,
            Frequency::Fixed => self.number <= 0xFF,
        }
    }

    pub(crate) fn write(self, buf: &mut BytesMut) -> Result<(), WireError> {
        if !self.is_encodable() {
            return Err(WireError::InvalidMessageId(self));
        }
        match self.frequency {
            Frequency::High => buf.put_u8(self.number as u8),
            Frequency::Medium => {
                buf.put_u8(0xFF);
                buf.put_u8(self.number as u8);
            }
            Frequency::Low => {
                buf.put_slice(&[0xFF, 0xFF]);
                buf.put_u16(self.number);
            }
            Frequency::Fixed => {
                buf.put_slice(&[0xFF, 0xFF, 0xFF]);
                buf.put_u8(self.number as u8);
            }
        }
        Ok(())
    }

    /// Read a message id, advancing the cursor past it.
    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let b = *buf;
        let (id, len) = match b {
            [] => return Err(WireError::Truncated { needed: 1, remaining: 0 }),
            [n, ..] if *n != 0xFF => (MessageId::high(*n), 1),
            [0xFF, n, ..] if *n != 0xFF => (MessageId::medium(*n), 2),
            [0xFF, 0xFF, hi, lo, ..] if *hi != 0xFF => {
                (MessageId::low(u16::from_be_bytes([*hi, *lo])), 4)
            }
            [0xFF, 0xFF, 0xFF, n, ..] => (MessageId::fixed(*n), 4),
            _ => {
                // Escape bytes present but the id itself is cut off.
                let needed = if b.len() < 2 { 2 } else { 4 };
                return Err(WireError::Truncated { needed, remaining: b.len() });
            }
        };
        *buf = &b[len..];
        Ok(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.frequency, self.number)
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Everything in a datagram that is not the message body.
///
/// The sequence number is assigned by the sender and only carried here;
/// ordering and retransmission are handled above this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    /// Extra header bytes. Simulators never send any, but the field exists.
    pub extra: Bytes,
    /// Acknowledged sequence numbers appended after the body.
    pub acks: Vec<u32>,
    pub(crate) message_id: MessageId,
}

impl PacketHeader {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            flags: PacketFlags::empty(),
            sequence: 0,
            extra: Bytes::new(),
            acks: Vec::new(),
            message_id,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn frequency(&self) -> Frequency {
        self.message_id.frequency
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_zero_coded(&self) -> bool {
        self.flags.contains(PacketFlags::ZERO_CODED)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }

    /// Bytes before the message id: prefix plus extra header.
    pub(crate) fn prefix_len(&self) -> usize {
        PREFIX_LEN + self.extra.len()
    }

    /// Bytes after the body: acks plus the count byte, or nothing.
    pub(crate) fn acks_len(&self) -> usize {
        if self.acks.is_empty() {
            0
        } else {
            self.acks.len() * 4 + 1
        }
    }

    pub(crate) fn write_prefix(&self, flags: PacketFlags, buf: &mut BytesMut) {
        let prefix = WirePrefix {
            flags: flags.bits(),
            sequence: self.sequence.to_be_bytes(),
            extra_len: self.extra.len() as u8,
        };
        buf.put_slice(prefix.as_bytes());
        buf.put_slice(&self.extra);
    }

    pub(crate) fn write_acks(&self, buf: &mut BytesMut) {
        if self.acks.is_empty() {
            return;
        }
        for ack in &self.acks {
            buf.put_u32(*ack);
        }
        buf.put_u8(self.acks.len() as u8);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting or producing wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated data: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unknown message id: {0}")]
    UnknownMessage(MessageId),

    #[error("message id not encodable: {0}")]
    InvalidMessageId(MessageId),

    #[error("encoded length {written} does not match predicted length {predicted}")]
    LengthMismatch { predicted: usize, written: usize },

    #[error("HAS_ACKS is set but the ack count is zero")]
    EmptyAckBlock,

    #[error("{0} unread bytes after message body")]
    TrailingBytes(usize),

    #[error("{field} is {len} long, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("zero-decoded data exceeds {} bytes", MAX_DECODED_SIZE)]
    DecodedTooLarge,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
