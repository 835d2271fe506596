//! Packet catalog: the message bodies this layer knows how to frame.
//!
//! Only the transport-level messages and `GenericStreamingMessage` live
//! here. Each message is an ordered list of blocks; a message's encoded
//! length is the sum of its blocks' lengths.

use bytes::{BufMut, BytesMut};

use crate::block::{self, read_repeated, repeated_length, write_repeated, Block, Variable2};
use crate::wire::{MessageId, WireError};

/// A message body with a fixed id and block order.
pub trait MessageBody: Sized {
    const ID: MessageId;
    const NAME: &'static str;

    fn length(&self) -> usize;
    fn decode(buf: &mut &[u8]) -> Result<Self, WireError>;
    fn encode(&self, buf: &mut BytesMut);
}

// ── StartPingCheck / CompletePingCheck ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPingIdBlock {
    pub ping_id: u8,
    /// Oldest unacknowledged sequence number the sender still holds.
    pub oldest_unacked: u32,
}

impl Block for StartPingIdBlock {
    fn length(&self) -> usize {
        5
    }

    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            ping_id: block::read_u8(buf)?,
            oldest_unacked: block::read_u32_le(buf)?,
        })
    }

    fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ping_id);
        buf.put_u32_le(self.oldest_unacked);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPingCheck {
    pub ping_id: StartPingIdBlock,
}

impl MessageBody for StartPingCheck {
    const ID: MessageId = MessageId::high(1);
    const NAME: &'static str = "StartPingCheck";

    fn length(&self) -> usize {
        self.ping_id.length()
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            ping_id: StartPingIdBlock::from_bytes(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.ping_id.to_bytes(buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletePingIdBlock {
    pub ping_id: u8,
}

impl Block for CompletePingIdBlock {
    fn length(&self) -> usize {
        1
    }

    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            ping_id: block::read_u8(buf)?,
        })
    }

    fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ping_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletePingCheck {
    pub ping_id: CompletePingIdBlock,
}

impl MessageBody for CompletePingCheck {
    const ID: MessageId = MessageId::high(2);
    const NAME: &'static str = "CompletePingCheck";

    fn length(&self) -> usize {
        self.ping_id.length()
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            ping_id: CompletePingIdBlock::from_bytes(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.ping_id.to_bytes(buf);
    }
}

// ── GenericStreamingMessage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDataBlock {
    pub method: u16,
}

impl Block for MethodDataBlock {
    fn length(&self) -> usize {
        2
    }

    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            method: block::read_u16_le(buf)?,
        })
    }

    fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.method);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBlock {
    pub data: Variable2,
}

impl Block for DataBlock {
    fn length(&self) -> usize {
        self.data.length()
    }

    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            data: Variable2::from_bytes(buf)?,
        })
    }

    fn to_bytes(&self, buf: &mut BytesMut) {
        self.data.to_bytes(buf);
    }
}

/// Opaque method-tagged payload streamed from the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericStreamingMessage {
    pub method_data: MethodDataBlock,
    pub data_block: DataBlock,
}

impl GenericStreamingMessage {
    pub fn new(method: u16, data: impl Into<bytes::Bytes>) -> Result<Self, WireError> {
        Ok(Self {
            method_data: MethodDataBlock { method },
            data_block: DataBlock {
                data: Variable2::new(data)?,
            },
        })
    }
}

impl MessageBody for GenericStreamingMessage {
    const ID: MessageId = MessageId::high(31);
    const NAME: &'static str = "GenericStreamingMessage";

    fn length(&self) -> usize {
        self.method_data.length() + self.data_block.length()
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            method_data: MethodDataBlock::from_bytes(buf)?,
            data_block: DataBlock::from_bytes(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.method_data.to_bytes(buf);
        self.data_block.to_bytes(buf);
    }
}

// ── PacketAck ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketAckBlock {
    pub id: u32,
}

impl Block for PacketAckBlock {
    fn length(&self) -> usize {
        4
    }

    fn from_bytes(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            id: block::read_u32_le(buf)?,
        })
    }

    fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.id);
    }
}

/// Standalone acknowledgement of received reliable packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketAck {
    packets: Vec<PacketAckBlock>,
}

impl PacketAck {
    pub const MAX_PACKETS: usize = u8::MAX as usize;

    pub fn new(ids: impl IntoIterator<Item = u32>) -> Result<Self, WireError> {
        let packets: Vec<_> = ids.into_iter().map(|id| PacketAckBlock { id }).collect();
        if packets.len() > Self::MAX_PACKETS {
            return Err(WireError::FieldTooLong {
                field: "PacketAck.Packets",
                len: packets.len(),
                max: Self::MAX_PACKETS,
            });
        }
        Ok(Self { packets })
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.packets.iter().map(|p| p.id)
    }
}

impl MessageBody for PacketAck {
    const ID: MessageId = MessageId::fixed(0xFB);
    const NAME: &'static str = "PacketAck";

    fn length(&self) -> usize {
        repeated_length(&self.packets)
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            packets: read_repeated(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_repeated(&self.packets, buf);
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

/// Every message body this layer can frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    StartPingCheck(StartPingCheck),
    CompletePingCheck(CompletePingCheck),
    GenericStreamingMessage(GenericStreamingMessage),
    PacketAck(PacketAck),
}

macro_rules! catalog {
    ($($variant:ident),* $(,)?) => {
        impl Message {
            pub fn id(&self) -> MessageId {
                match self {
                    $(Message::$variant(_) => $variant::ID,)*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Message::$variant(_) => $variant::NAME,)*
                }
            }

            /// Encoded body length, excluding the message id.
            pub fn length(&self) -> usize {
                match self {
                    $(Message::$variant(m) => m.length(),)*
                }
            }

            pub(crate) fn encode(&self, buf: &mut BytesMut) {
                match self {
                    $(Message::$variant(m) => m.encode(buf),)*
                }
            }

            /// Decode the body registered for `id`.
            pub fn decode(id: MessageId, buf: &mut &[u8]) -> Result<Self, WireError> {
                $(
                    if id == $variant::ID {
                        return Ok(Message::$variant($variant::decode(buf)?));
                    }
                )*
                Err(WireError::UnknownMessage(id))
            }

            /// Look up a message id by name.
            pub fn id_for(name: &str) -> Option<MessageId> {
                $(
                    if name == $variant::NAME {
                        return Some($variant::ID);
                    }
                )*
                None
            }
        }

        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

catalog!(
    StartPingCheck,
    CompletePingCheck,
    GenericStreamingMessage,
    PacketAck,
);
