//! Decoded packets from either delivery path, on one channel.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::mpsc;

use simwire_core::Packet;

use crate::pool::PacketBuffer;
use crate::transport::PacketHandler;

/// Where a packet arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSource {
    Udp(SocketAddr),
    /// Carried as a hex body on the HTTP event queue.
    EventQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub source: PacketSource,
    pub packet: Packet,
}

pub type PacketSink = mpsc::UnboundedSender<InboundPacket>;

/// [`PacketHandler`] that decodes datagrams and forwards them to a sink.
pub struct PacketIngest {
    sink: PacketSink,
}

impl PacketIngest {
    pub fn new(sink: PacketSink) -> Self {
        Self { sink }
    }
}

impl PacketHandler for PacketIngest {
    fn on_packet_received(&self, buffer: &PacketBuffer) -> anyhow::Result<()> {
        let remote = buffer.remote().context("buffer was never filled")?;
        let packet = Packet::decode(buffer.bytes())
            .with_context(|| format!("malformed datagram from {remote}"))?;
        tracing::trace!(
            %remote,
            message = packet.name(),
            sequence = packet.header().sequence,
            "packet decoded"
        );
        self.sink
            .send(InboundPacket {
                source: PacketSource::Udp(remote),
                packet,
            })
            .context("packet sink closed")?;
        Ok(())
    }
}
