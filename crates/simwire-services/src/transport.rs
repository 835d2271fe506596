//! UDP circuit transport.
//!
//! One socket, one outstanding receive. The receive task hands each filled
//! buffer to the dispatch task and immediately issues the next read, so a
//! slow handler never leaves the socket idle.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use simwire_core::config::NetworkConfig;
use simwire_core::{Packet, WireError};

use crate::pool::{lock, BufferPool, PacketBuffer, PooledBuffer};

/// Filled buffers waiting for the handler.
const RECEIVE_QUEUE_DEPTH: usize = 256;

/// Hooks the transport calls as datagrams move.
pub trait PacketHandler: Send + Sync {
    /// Called on the dispatch task for every received datagram.
    ///
    /// Errors are logged and the datagram dropped; the transport keeps going.
    fn on_packet_received(&self, buffer: &PacketBuffer) -> anyhow::Result<()>;

    /// Called after a successful send. Never runs concurrently with itself.
    fn on_packet_sent(&self, _bytes: &[u8], _remote: SocketAddr, _sent: usize) {}
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("transport is not running")]
    NotRunning,
    #[error("failed to encode packet: {0}")]
    Encode(#[from] WireError),
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TransportStats {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    last_receive_wait_us: AtomicU64,
    connection_resets: AtomicU64,
    watchdog_trips: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub last_receive_wait_us: u64,
    pub connection_resets: u64,
    pub watchdog_trips: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            last_receive_wait_us: self.last_receive_wait_us.load(Ordering::Relaxed),
            connection_resets: self.connection_resets.load(Ordering::Relaxed),
            watchdog_trips: self.watchdog_trips.load(Ordering::Relaxed),
        }
    }

    fn record_receive(&self, len: usize, waited: Duration) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.last_receive_wait_us
            .store(waited.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_send(&self, len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

struct Running {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    shutdown: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
}

pub struct UdpTransport {
    config: NetworkConfig,
    pool: BufferPool,
    handler: Arc<dyn PacketHandler>,
    stats: Arc<TransportStats>,
    running: Mutex<Option<Running>>,
    sent_hook: Mutex<()>,
}

impl UdpTransport {
    pub fn new(config: NetworkConfig, pool: BufferPool, handler: Arc<dyn PacketHandler>) -> Self {
        Self {
            config,
            pool,
            handler,
            stats: Arc::new(TransportStats::default()),
            running: Mutex::new(None),
            sent_hook: Mutex::new(()),
        }
    }

    /// Bind and start receiving. Must be called inside a tokio runtime.
    ///
    /// Returns the bound address. Calling it again while running is a no-op
    /// that returns the existing address.
    pub fn start(&self, bind: SocketAddr) -> Result<SocketAddr, TransportError> {
        let mut running = lock(&self.running);
        if let Some(current) = running.as_ref() {
            return Ok(current.local);
        }

        let std_socket =
            bind_socket(bind).map_err(|source| TransportError::Bind { addr: bind, source })?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|source| TransportError::Bind { addr: bind, source })?;
        let local = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr: bind, source })?;
        let socket = Arc::new(socket);

        let (shutdown, _) = broadcast::channel(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let (queue_tx, queue_rx) = mpsc::channel(RECEIVE_QUEUE_DEPTH);

        tokio::spawn(receive_loop(
            socket.clone(),
            self.pool.clone(),
            queue_tx,
            self.stats.clone(),
            self.config.watchdog(),
            stopping.clone(),
            shutdown.subscribe(),
        ));
        tokio::spawn(dispatch_loop(
            queue_rx,
            self.handler.clone(),
            shutdown.subscribe(),
        ));

        tracing::info!(addr = %local, "transport bound");
        *running = Some(Running {
            socket,
            local,
            shutdown,
            stopping,
        });
        Ok(local)
    }

    /// Stop receiving and release the socket. Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.stopping.store(true, Ordering::SeqCst);
        let _ = running.shutdown.send(());
        tracing::info!(addr = %running.local, "transport stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|r| r.local)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Send one datagram.
    ///
    /// Socket failures and timeouts are logged and reported as `Ok(0)`; the
    /// circuit layer treats them as packet loss. Only sending on a stopped
    /// transport is an error.
    pub async fn send(&self, remote: SocketAddr, bytes: &[u8]) -> Result<usize, TransportError> {
        let socket = lock(&self.running)
            .as_ref()
            .map(|r| r.socket.clone())
            .ok_or(TransportError::NotRunning)?;

        match tokio::time::timeout(self.config.send_timeout(), socket.send_to(bytes, remote)).await
        {
            Ok(Ok(sent)) => {
                self.stats.record_send(sent);
                tracing::trace!(%remote, bytes = sent, "datagram sent");
                let _serial = lock(&self.sent_hook);
                self.handler.on_packet_sent(bytes, remote, sent);
                Ok(sent)
            }
            Ok(Err(e)) => {
                tracing::warn!(%remote, error = %e, "send failed");
                Ok(0)
            }
            Err(_) => {
                tracing::warn!(%remote, timeout_ms = self.config.send_timeout_ms, "send timed out");
                Ok(0)
            }
        }
    }

    /// Encode `packet` and send it.
    pub async fn send_packet(
        &self,
        remote: SocketAddr,
        packet: &Packet,
    ) -> Result<usize, TransportError> {
        let bytes = packet.encode()?;
        self.send(remote, &bytes).await
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the circuit socket. Address reuse is off so a second transport
/// cannot silently share the port.
fn bind_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(false)?;
    suppress_connection_reset(&socket);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// An ICMP port-unreachable for an earlier send can surface as a
/// ConnectionReset on the next receive. socket2 exposes no switch for it,
/// so the receive loop skips those errors instead.
fn suppress_connection_reset(_socket: &Socket) {
    tracing::debug!("connection-reset suppression unavailable, receive loop will skip resets");
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    pool: BufferPool,
    queue: mpsc::Sender<PooledBuffer>,
    stats: Arc<TransportStats>,
    watchdog: Duration,
    stopping: Arc<AtomicBool>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut seen_any = false;

    loop {
        let mut buffer = pool.acquire();
        let started = Instant::now();

        let result = tokio::select! {
            _ = shutdown.recv() => break,
            r = tokio::time::timeout(watchdog, socket.recv_from(buffer.storage_mut())) => r,
        };

        match result {
            Ok(Ok((len, remote))) => {
                seen_any = true;
                stats.record_receive(len, started.elapsed());
                buffer.filled(len, remote);
                tracing::trace!(%remote, bytes = len, "datagram received");
                if queue.send(buffer).await.is_err() {
                    tracing::warn!("dispatch queue closed, receive loop ending");
                    break;
                }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                stats.connection_resets.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("connection reset on receive, re-arming");
            }
            Ok(Err(e)) => {
                if !stopping.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "receive failed, receive loop ending");
                }
                break;
            }
            Err(_) => {
                if seen_any {
                    stats.watchdog_trips.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        silent_ms = watchdog.as_millis() as u64,
                        "no datagrams received within watchdog interval"
                    );
                }
            }
        }
    }
}

async fn dispatch_loop(
    mut queue: mpsc::Receiver<PooledBuffer>,
    handler: Arc<dyn PacketHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            next = queue.recv() => {
                let Some(buffer) = next else { return };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.on_packet_received(&buffer)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        remote = ?buffer.remote(),
                        bytes = buffer.len(),
                        error = %e,
                        "packet handler failed, datagram dropped"
                    ),
                    Err(payload) => tracing::warn!(
                        remote = ?buffer.remote(),
                        bytes = buffer.len(),
                        panic = panic_message(&*payload),
                        "packet handler panicked, datagram dropped"
                    ),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
