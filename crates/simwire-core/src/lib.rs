//! simwire-core: wire format, packet codec, and shared configuration.
//! All other simwire crates depend on this one.

pub mod block;
pub mod config;
pub mod event;
pub mod message;
pub mod packet;
pub mod wire;
pub mod zerocode;

pub use block::Block;
pub use event::{EventMessage, EventRegistry};
pub use message::{GenericStreamingMessage, Message};
pub use packet::Packet;
pub use wire::{Frequency, MessageId, PacketFlags, PacketHeader, WireError};
