//! Packet framing. Prefix, optional zero-coded body, trailing acks.

use bytes::{Bytes, BytesMut};
use zerocopy::FromBytes;

use crate::message::Message;
use crate::wire::{
    PacketFlags, PacketHeader, WireError, WirePrefix, MAX_APPENDED_ACKS, PREFIX_LEN,
};
use crate::zerocode::{zero_decode, zero_encode};

/// A header plus one message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    message: Message,
}

impl Packet {
    /// Wrap a message with a default header (sequence 0, no flags).
    pub fn new(message: impl Into<Message>) -> Self {
        let message = message.into();
        Self {
            header: PacketHeader::new(message.id()),
            message,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.header.sequence = sequence;
        self
    }

    /// HAS_ACKS is not taken from `flags`; it always follows the ack list.
    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.header.flags.insert(flags);
        self.sync_ack_flag();
        self
    }

    pub fn with_acks(mut self, acks: Vec<u32>) -> Self {
        self.header.acks = acks;
        self.sync_ack_flag();
        self
    }

    fn sync_ack_flag(&mut self) {
        let has_acks = !self.header.acks.is_empty();
        self.header.flags.set(PacketFlags::HAS_ACKS, has_acks);
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut PacketHeader {
        &mut self.header
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn name(&self) -> &'static str {
        self.message.name()
    }

    /// Encoded size before zero-coding.
    pub fn length(&self) -> usize {
        self.header.prefix_len()
            + self.header.message_id.len()
            + self.message.length()
            + self.header.acks_len()
    }

    /// Serialize to a datagram.
    ///
    /// The HAS_ACKS flag follows the ack list. When ZERO_CODED is set the
    /// message id and body are zero-coded; the prefix and acks never are.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let header = &self.header;
        if header.extra.len() > u8::MAX as usize {
            return Err(WireError::FieldTooLong {
                field: "extra header",
                len: header.extra.len(),
                max: u8::MAX as usize,
            });
        }
        if header.acks.len() > MAX_APPENDED_ACKS {
            return Err(WireError::FieldTooLong {
                field: "appended acks",
                len: header.acks.len(),
                max: MAX_APPENDED_ACKS,
            });
        }

        let body_len = header.message_id.len() + self.message.length();
        let mut body = BytesMut::with_capacity(body_len);
        header.message_id.write(&mut body)?;
        self.message.encode(&mut body);
        if body.len() != body_len {
            return Err(WireError::LengthMismatch {
                predicted: self.length(),
                written: header.prefix_len() + body.len() + header.acks_len(),
            });
        }

        let mut flags = header.flags;
        flags.set(PacketFlags::HAS_ACKS, !header.acks.is_empty());

        let body = if flags.contains(PacketFlags::ZERO_CODED) {
            Bytes::from(zero_encode(&body))
        } else {
            body.freeze()
        };

        let mut out = BytesMut::with_capacity(header.prefix_len() + body.len() + header.acks_len());
        header.write_prefix(flags, &mut out);
        out.extend_from_slice(&body);
        header.write_acks(&mut out);
        Ok(out.freeze())
    }

    /// Parse a datagram.
    ///
    /// Fails with [`WireError::Truncated`] when any part is cut short,
    /// [`WireError::UnknownMessage`] for ids outside the catalog, and
    /// [`WireError::TrailingBytes`] when the body leaves bytes unread.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let prefix = WirePrefix::read_from_prefix(bytes).ok_or(WireError::Truncated {
            needed: PREFIX_LEN,
            remaining: bytes.len(),
        })?;
        let flags = PacketFlags::from_bits_truncate(prefix.flags);
        let sequence = u32::from_be_bytes(prefix.sequence);

        let rest = &bytes[PREFIX_LEN..];
        let extra_len = prefix.extra_len as usize;
        if rest.len() < extra_len {
            return Err(WireError::Truncated {
                needed: extra_len,
                remaining: rest.len(),
            });
        }
        let (extra, mut rest) = rest.split_at(extra_len);

        let mut acks = Vec::new();
        if flags.contains(PacketFlags::HAS_ACKS) {
            let (&count, head) = rest
                .split_last()
                .ok_or(WireError::Truncated { needed: 1, remaining: 0 })?;
            if count == 0 {
                return Err(WireError::EmptyAckBlock);
            }
            let ack_bytes = count as usize * 4;
            if head.len() < ack_bytes {
                return Err(WireError::Truncated {
                    needed: ack_bytes,
                    remaining: head.len(),
                });
            }
            let (body, ack_region) = head.split_at(head.len() - ack_bytes);
            acks = ack_region
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            rest = body;
        }

        let expanded;
        let mut body = if flags.contains(PacketFlags::ZERO_CODED) {
            expanded = zero_decode(rest)?;
            &expanded[..]
        } else {
            rest
        };

        let message_id = crate::wire::MessageId::read(&mut body)?;
        let message = Message::decode(message_id, &mut body)?;
        if !body.is_empty() {
            return Err(WireError::TrailingBytes(body.len()));
        }

        Ok(Self {
            header: PacketHeader {
                flags,
                sequence,
                extra: Bytes::copy_from_slice(extra),
                acks,
                message_id,
            },
            message,
        })
    }
}
