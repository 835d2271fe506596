//! simwired: simulator circuit daemon.
//!
//! Usage: simwired [SEED_URL] [SIM_ADDR]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use tokio::sync::mpsc;

use simwire_core::config::SimwireConfig;
use simwire_core::message::{
    CompletePingCheck, CompletePingIdBlock, PacketAck, StartPingCheck, StartPingIdBlock,
};
use simwire_core::wire::MAX_PACKET_SIZE;
use simwire_core::{Message, Packet};
use simwire_services::{
    BufferPool, Caps, CapsEvent, InboundPacket, PacketIngest, PacketSource, UdpTransport,
};

/// How often the circuit is pinged when a simulator address is given.
const PING_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SimwireConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SimwireConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SimwireConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let seed = args
        .next()
        .map(|s| Url::parse(&s))
        .transpose()
        .context("invalid seed URL")?;
    let sim: Option<SocketAddr> = args
        .next()
        .map(|s| s.parse::<SocketAddr>())
        .transpose()
        .context("invalid simulator address")?;
    tracing::info!(seed = ?seed, sim = ?sim, "simwired starting");

    // ── Circuit ──────────────────────────────────────────────────────────────
    let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
    let pool = BufferPool::with_preallocated(MAX_PACKET_SIZE, config.network.pool_buffers);
    let transport = Arc::new(UdpTransport::new(
        config.network.clone(),
        pool,
        Arc::new(PacketIngest::new(packet_tx.clone())),
    ));
    let local = transport
        .start(config.network.bind_addr)
        .context("failed to bind circuit socket")?;
    tracing::info!(addr = %local, "circuit socket ready");

    // ── Capabilities ─────────────────────────────────────────────────────────
    let (caps_tx, mut caps_rx) = mpsc::unbounded_channel();
    let caps = Caps::new(&config, caps_tx, packet_tx);
    if let Some(seed) = seed {
        caps.connect(seed);
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    let mut ping_id: u8 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            _ = ping_timer.tick(), if sim.is_some() => {
                if let Some(sim) = sim {
                    ping_id = ping_id.wrapping_add(1);
                    let ping = Packet::new(StartPingCheck {
                        ping_id: StartPingIdBlock { ping_id, oldest_unacked: 0 },
                    });
                    if let Err(e) = transport.send_packet(sim, &ping).await {
                        tracing::warn!(%sim, error = %e, "failed to ping simulator");
                    }
                }
            }

            Some(inbound) = packet_rx.recv() => {
                handle_packet(&transport, inbound).await;
            }

            Some(event) = caps_rx.recv() => {
                handle_caps_event(&caps, event);
            }
        }
    }

    caps.disconnect();
    transport.stop();
    let stats = transport.stats();
    tracing::info!(
        packets_received = stats.packets_received,
        packets_sent = stats.packets_sent,
        connection_resets = stats.connection_resets,
        watchdog_trips = stats.watchdog_trips,
        "simwired stopped"
    );
    Ok(())
}

async fn handle_packet(transport: &UdpTransport, inbound: InboundPacket) {
    let InboundPacket { source, packet } = inbound;
    let header = packet.header();
    tracing::debug!(
        source = ?source,
        message = packet.name(),
        sequence = header.sequence,
        reliable = header.is_reliable(),
        "packet"
    );

    let PacketSource::Udp(remote) = source else {
        return;
    };

    if header.is_reliable() {
        match PacketAck::new([header.sequence]) {
            Ok(ack) => {
                if let Err(e) = transport.send_packet(remote, &Packet::new(ack)).await {
                    tracing::warn!(%remote, error = %e, "failed to ack packet");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to build ack"),
        }
    }

    match packet.message() {
        Message::StartPingCheck(ping) => {
            let reply = Packet::new(CompletePingCheck {
                ping_id: CompletePingIdBlock {
                    ping_id: ping.ping_id.ping_id,
                },
            });
            if let Err(e) = transport.send_packet(remote, &reply).await {
                tracing::warn!(%remote, error = %e, "failed to answer ping");
            }
        }
        Message::GenericStreamingMessage(streaming) => {
            let data = streaming.data_block.data.as_bytes();
            tracing::debug!(
                method = streaming.method_data.method,
                len = data.len(),
                head = hex::encode(&data[..data.len().min(16)]),
                "streaming message"
            );
        }
        Message::PacketAck(ack) => {
            tracing::trace!(acked = ack.ids().count(), "acks received");
        }
        Message::CompletePingCheck(_) => {}
    }
}

fn handle_caps_event(caps: &Caps, event: CapsEvent) {
    match event {
        CapsEvent::CapabilitiesReceived { count } => {
            tracing::info!(
                count,
                texture = ?caps.registry().texture_uri().map(|u| u.to_string()),
                mesh = ?caps.registry().mesh_uri().map(|u| u.to_string()),
                "capabilities ready"
            );
        }
        CapsEvent::Error(e) => {
            tracing::error!(error = %e, seed = ?caps.seed_uri(), "capability negotiation gave up");
        }
        CapsEvent::EventQueueConnected => {
            tracing::info!("event queue connected");
        }
        CapsEvent::EventQueueStopped => {
            tracing::warn!(state = ?caps.event_queue_state(), "event queue stopped");
        }
        CapsEvent::Message(message) => {
            tracing::info!(event = message.name(), "event");
        }
    }
}
