//! simwire-services: the simulator connection. UDP transport, receive
//! buffers, capability negotiation and the event queue.

pub mod caps;
pub mod ingest;
pub mod pool;
pub mod transport;

pub use caps::{
    CapabilityRegistry, Caps, CapsError, CapsEvent, EventQueueClient, EventQueueState,
    SeedNegotiator, SeedOutcome,
};
pub use ingest::{InboundPacket, PacketIngest, PacketSink, PacketSource};
pub use pool::{BufferPool, PacketBuffer, PooledBuffer};
pub use transport::{PacketHandler, StatsSnapshot, TransportError, TransportStats, UdpTransport};
