//! One task per TCP connection, shuttling bytes between the socket and the
//! [`PeerManager`].
//!
//! The write half lives in the [`TokioDescriptor`] so the peer manager can
//! write synchronously with `try_write`. When the kernel buffer is full the
//! connection task waits for writability and reports it back through
//! [`PeerManager::write_buffer_space_avail`].

use crate::error::{TransportError, TransportResult};
use bitcoin::secp256k1::PublicKey;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thunder_core::{PeerManager, SocketDescriptor};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// Give up on outbound connections that take longer than this
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// The peer manager as this crate drives it
pub type TokioPeerManager = PeerManager<TokioDescriptor>;

#[derive(Debug)]
enum ConnectionEvent {
    /// `try_write` came up short; wait until the socket drains
    WaitWritable,
    /// The peer manager wants reads resumed
    ResumeRead,
    /// The peer manager closed the connection
    Disconnect,
}

/// A TCP connection as the peer manager sees it
#[derive(Clone)]
pub struct TokioDescriptor {
    id: u64,
    writer: Arc<OwnedWriteHalf>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    read_paused: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl TokioDescriptor {
    /// Process-unique connection id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl PartialEq for TokioDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TokioDescriptor {}

impl Hash for TokioDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl SocketDescriptor for TokioDescriptor {
    fn send_data(&mut self, data: &[u8], resume_read: bool) -> usize {
        if resume_read && self.read_paused.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(ConnectionEvent::ResumeRead);
        }
        if data.is_empty() || self.closed.load(Ordering::Acquire) {
            return 0;
        }
        match self.writer.try_write(data) {
            Ok(written) => {
                if written < data.len() {
                    let _ = self.events.send(ConnectionEvent::WaitWritable);
                }
                written
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let _ = self.events.send(ConnectionEvent::WaitWritable);
                0
            }
            Err(e) => {
                debug!(connection = self.id, error = %e, "write failed");
                0
            }
        }
    }

    fn disconnect_socket(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(ConnectionEvent::Disconnect);
        }
    }
}

struct Connection {
    descriptor: TokioDescriptor,
    reader: OwnedReadHalf,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

fn split(stream: TcpStream) -> Connection {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    Connection {
        descriptor: TokioDescriptor {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            writer: Arc::new(writer),
            events: tx,
            read_paused: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        },
        reader,
        events: rx,
    }
}

/// Write all of `data`, waiting for the socket as needed
async fn write_all(writer: &OwnedWriteHalf, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        writer.writable().await?;
        match writer.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => data = &data[written..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl Connection {
    /// Pump the socket until either side hangs up
    async fn run(mut self, peer_manager: Arc<TokioPeerManager>) {
        let mut descriptor = self.descriptor.clone();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut notify_disconnect = true;

        loop {
            let paused = descriptor.read_paused.load(Ordering::Acquire);
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ConnectionEvent::WaitWritable) => {
                        if let Err(e) = descriptor.writer.writable().await {
                            debug!(connection = descriptor.id, error = %e, "socket failed while waiting to write");
                            break;
                        }
                        if peer_manager.write_buffer_space_avail(&mut descriptor).is_err() {
                            notify_disconnect = false;
                            break;
                        }
                    }
                    Some(ConnectionEvent::ResumeRead) => trace!(connection = descriptor.id, "resuming reads"),
                    Some(ConnectionEvent::Disconnect) | None => {
                        notify_disconnect = false;
                        break;
                    }
                },
                read = self.reader.read(&mut buf), if !paused => match read {
                    Ok(0) => {
                        debug!(connection = descriptor.id, "remote closed connection");
                        break;
                    }
                    Ok(n) => match peer_manager.read_event(&mut descriptor, &buf[..n]) {
                        Ok(pause) => {
                            if pause {
                                descriptor.read_paused.store(true, Ordering::Release);
                            }
                            peer_manager.process_events();
                        }
                        Err(e) => {
                            debug!(connection = descriptor.id, error = %e, "peer manager dropped connection");
                            notify_disconnect = false;
                            break;
                        }
                    },
                    Err(e) => {
                        debug!(connection = descriptor.id, error = %e, "read failed");
                        break;
                    }
                },
            }
        }

        descriptor.closed.store(true, Ordering::Release);
        if notify_disconnect {
            peer_manager.socket_disconnected(&descriptor);
        }
        peer_manager.process_events();
    }
}

/// Hand an accepted connection to the peer manager and run it to
/// completion
///
/// # Errors
///
/// [`TransportError::Rejected`] if the peer manager refuses the socket.
pub async fn setup_inbound(peer_manager: Arc<TokioPeerManager>, stream: TcpStream) -> TransportResult<()> {
    let _ = stream.set_nodelay(true);
    let connection = split(stream);
    peer_manager.new_inbound_connection(connection.descriptor.clone())?;
    debug!(connection = connection.descriptor.id, "accepted inbound connection");
    connection.run(peer_manager).await;
    Ok(())
}

/// Connect to `their_node_id` at `addr`, send act one and spawn the
/// connection task
///
/// # Errors
///
/// [`TransportError::ConnectionFailed`] on timeout,
/// [`TransportError::Io`] if the socket fails, or
/// [`TransportError::Rejected`] if the peer manager refuses the socket.
pub async fn connect_outbound(
    peer_manager: Arc<TokioPeerManager>,
    their_node_id: PublicKey,
    addr: SocketAddr,
) -> TransportResult<JoinHandle<()>> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectionFailed(format!("timed out connecting to {addr}")))??;
    let _ = stream.set_nodelay(true);
    let connection = split(stream);
    let act_one = peer_manager.new_outbound_connection(their_node_id, connection.descriptor.clone())?;
    if let Err(e) = write_all(&connection.descriptor.writer, &act_one).await {
        peer_manager.socket_disconnected(&connection.descriptor);
        return Err(e.into());
    }
    info!(peer = %their_node_id, %addr, "connected");
    Ok(tokio::spawn(connection.run(peer_manager)))
}

/// Accept connections forever, one task each
///
/// # Errors
///
/// [`TransportError::Io`] if accepting fails.
pub async fn listen(peer_manager: Arc<TokioPeerManager>, listener: TcpListener) -> TransportResult<()> {
    info!(addr = %listener.local_addr()?, "listening for peers");
    loop {
        let (stream, addr) = listener.accept().await?;
        trace!(%addr, "incoming connection");
        let peer_manager = Arc::clone(&peer_manager);
        tokio::spawn(async move {
            if let Err(e) = setup_inbound(peer_manager, stream).await {
                warn!(%addr, error = %e, "inbound connection failed");
            }
        });
    }
}

/// Spawn the periodic work: flushing handler events every
/// `event_interval` and pinging peers every `ping_interval`
pub fn spawn_timers(
    peer_manager: Arc<TokioPeerManager>,
    event_interval: Duration,
    ping_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = tokio::time::interval(event_interval);
        let mut pings = tokio::time::interval(ping_interval);
        pings.tick().await;
        loop {
            tokio::select! {
                _ = events.tick() => peer_manager.process_events(),
                _ = pings.tick() => peer_manager.timer_tick_occurred(),
            }
        }
    })
}
