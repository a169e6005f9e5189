//! TCP peer transport.
//!
//! One task runs the accept loop; every accepted or dialed connection gets
//! its own task running a framed read loop. All read loops publish onto a
//! single shared inbound channel consumed by the node's dispatch loop.
//!
//! # Stream hand-off
//!
//! When a decoded frame announces a follow-on raw byte stream (see
//! [`MessageKind::carries_stream`]), the read loop arms a fresh one-shot
//! gate on the peer and parks. The consumer locks the peer's read half,
//! pulls exactly the announced number of raw bytes off the socket, and
//! signals the gate via [`TcpPeer::finish_stream`]; only then does the
//! read loop resume framed decoding. Without the park, the decoder would
//! parse raw file bytes as a frame header and corrupt the connection.
//! The park is bounded: a consumer that never signals gets the connection
//! closed after `stream_wait` instead of a leaked task.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::time;
use tracing::{debug, info, warn};

use super::message::MessageKind;
use super::wire::{FrameCodec, FrameError};

/// Direction of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote side dialed us.
    Inbound,
    /// We dialed the remote side.
    Outbound,
}

/// The transport-level unit handed to the application: one frame's raw
/// payload plus the sending peer's address. The transport does not
/// interpret the payload beyond the kind byte.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Remote address of the sending peer.
    pub from: SocketAddr,
    /// The frame's kind byte.
    pub kind: u8,
    /// The frame's raw payload.
    pub payload: Vec<u8>,
}

/// Handshake applied to every new connection before it becomes usable.
///
/// Runs after accept/dial and before `on_peer`; an error tears the
/// connection down without it ever reaching the application. The default
/// [`NoopHandshake`] always succeeds — this trait is the seam for mutual
/// authentication without touching the read loop.
pub trait Handshake: Send + Sync + 'static {
    fn perform<'a>(
        &'a self,
        stream: &'a mut TcpStream,
        direction: Direction,
    ) -> BoxFuture<'a, io::Result<()>>;
}

/// Handshake that accepts every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandshake;

impl Handshake for NoopHandshake {
    fn perform<'a>(
        &'a self,
        _stream: &'a mut TcpStream,
        _direction: Direction,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A peer was refused by the application during `on_peer`.
#[derive(Debug, Clone)]
pub struct PeerRejected(pub String);

impl fmt::Display for PeerRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer rejected: {}", self.0)
    }
}

impl std::error::Error for PeerRejected {}

/// Connection lifecycle callbacks, implemented by the node.
///
/// `on_peer` runs exactly once per connection, after handshake success and
/// before the read loop starts; an error tears the connection down.
/// `on_peer_closed` runs when the read loop exits, so registry removal is
/// tied to connection teardown.
pub trait PeerCallback: Send + Sync + 'static {
    fn on_peer<'a>(&'a self, peer: Arc<TcpPeer>) -> BoxFuture<'a, Result<(), PeerRejected>>;

    fn on_peer_closed<'a>(&'a self, addr: SocketAddr) -> BoxFuture<'a, ()>;
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Frame limits for the wire codec.
    pub codec: FrameCodec,
    /// How long a read loop stays parked waiting for an announced raw
    /// stream to be consumed before the connection is forcibly closed.
    pub stream_wait: Duration,
    /// Capacity of the shared inbound envelope channel.
    pub inbound_capacity: usize,
}

impl TcpTransportConfig {
    /// Config with default codec limits and timeouts.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            codec: FrameCodec::default(),
            stream_wait: Duration::from_secs(30),
            inbound_capacity: 64,
        }
    }
}

/// A live, bidirectional connection to a remote node.
///
/// The read half is owned by the connection's read loop except while the
/// loop is parked on the stream gate; the write half is shared behind a
/// lock so control frames and raw payload pushes never interleave
/// mid-write.
pub struct TcpPeer {
    addr: SocketAddr,
    direction: Direction,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    stream_gate: StdMutex<Option<oneshot::Sender<()>>>,
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .finish()
    }
}

impl TcpPeer {
    fn new(stream: TcpStream, direction: Direction) -> io::Result<Arc<Self>> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Arc::new(Self {
            addr,
            direction,
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            stream_gate: StdMutex::new(None),
        }))
    }

    /// Remote address; the peer's identity in the registry.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether we dialed this peer or it dialed us.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Write raw bytes to the peer under the exclusive write lock.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Write a pre-encoded frame and then stream everything from `reader`,
    /// back-to-back under a single hold of the write lock. Returns the
    /// number of raw bytes copied after the frame.
    ///
    /// This is the payload-push half of the transfer protocol: because the
    /// marker frame and the raw bytes are written atomically, no other
    /// frame can land inside the receiver's raw-byte window.
    pub async fn send_with_stream<R>(&self, frame: &[u8], reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        let copied = tokio::io::copy(reader, &mut *writer).await?;
        writer.flush().await?;
        Ok(copied)
    }

    /// Exclusive access to the raw read half.
    ///
    /// Only meaningful while this peer's read loop is parked on the stream
    /// gate: the caller pulls the announced raw bytes off the socket,
    /// drops the guard, then calls [`TcpPeer::finish_stream`].
    pub async fn stream_reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Arm a fresh one-shot gate for an announced stream. Called by the
    /// read loop before it publishes the envelope and parks.
    fn arm_stream_gate(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut gate = self.stream_gate.lock().expect("stream gate lock poisoned");
        *gate = Some(tx);
        rx
    }

    /// Signal that the announced raw stream has been fully consumed, so
    /// this peer's read loop resumes framed decoding.
    ///
    /// Returns false if no stream was pending.
    pub fn finish_stream(&self) -> bool {
        let tx = self
            .stream_gate
            .lock()
            .expect("stream gate lock poisoned")
            .take();
        match tx {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// TCP transport: listener, dialer, and per-connection read loops feeding
/// one shared inbound channel.
pub struct TcpTransport {
    config: TcpTransportConfig,
    handshake: Arc<dyn Handshake>,
    callback: Arc<dyn PeerCallback>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<Envelope>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    /// Self-reference for handing clones to spawned connection tasks.
    me: Weak<TcpTransport>,
}

impl TcpTransport {
    /// Create a transport. Nothing is bound until
    /// [`TcpTransport::listen_and_accept`].
    pub fn new(
        config: TcpTransportConfig,
        handshake: Arc<dyn Handshake>,
        callback: Arc<dyn PeerCallback>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            config,
            handshake,
            callback,
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            local_addr: StdMutex::new(None),
            shutdown_tx,
            me: me.clone(),
        })
    }

    fn strong(&self) -> Arc<TcpTransport> {
        self.me.upgrade().expect("transport is alive while borrowed")
    }

    /// The bound listen address, once `listen_and_accept` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr lock poisoned")
    }

    /// Take the shared inbound channel. There is exactly one consumer;
    /// subsequent calls return `None`.
    pub fn consume(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound_rx
            .lock()
            .expect("inbound channel lock poisoned")
            .take()
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Fails fast if the bind fails; a single failed accept inside the
    /// loop is logged and the loop continues. Does not block beyond the
    /// bind itself.
    pub async fn listen_and_accept(&self) -> io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().expect("local addr lock poisoned") = Some(addr);
        info!(addr = %addr, "transport listening");

        let transport = self.strong();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!(peer = %remote, "accepted connection");
                            let conn = Arc::clone(&transport);
                            tokio::spawn(async move {
                                conn.handle_connection(stream, Direction::Inbound).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept error");
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(addr = %addr, "accept loop stopped");
        });
        Ok(())
    }

    /// Dial a remote peer. Returns once the connection attempt itself
    /// resolves; handshake and read loop run on their own task.
    pub async fn dial(&self, addr: SocketAddr) -> io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        let transport = self.strong();
        tokio::spawn(async move {
            transport.handle_connection(stream, Direction::Outbound).await;
        });
        Ok(())
    }

    /// Stop the accept loop and release the listener.
    ///
    /// Already-active connections are untouched; each tears itself down on
    /// its own read error or peer close. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn handle_connection(&self, mut stream: TcpStream, direction: Direction) {
        let remote = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, "connection lost before handshake");
                return;
            }
        };

        if let Err(e) = self.handshake.perform(&mut stream, direction).await {
            debug!(peer = %remote, error = %e, "handshake failed");
            return;
        }

        let peer = match TcpPeer::new(stream, direction) {
            Ok(peer) => peer,
            Err(e) => {
                debug!(peer = %remote, error = %e, "connection setup failed");
                return;
            }
        };

        if let Err(e) = self.callback.on_peer(Arc::clone(&peer)).await {
            debug!(peer = %remote, error = %e, "peer refused");
            return;
        }

        if let Err(e) = self.read_loop(&peer).await {
            debug!(peer = %remote, error = %e, "dropping peer connection");
        }
        self.callback.on_peer_closed(remote).await;
    }

    /// Decode frames until the connection errors, the consumer goes away,
    /// or a stream hand-off times out.
    async fn read_loop(&self, peer: &Arc<TcpPeer>) -> Result<(), FrameError> {
        let codec = self.config.codec;
        loop {
            let frame = {
                let mut reader = peer.stream_reader().await;
                codec.read_frame(&mut *reader).await?
            };

            let carries_stream = MessageKind::from_byte(frame.kind)
                .map_or(false, |kind| kind.carries_stream());
            let gate = if carries_stream {
                Some(peer.arm_stream_gate())
            } else {
                None
            };

            let envelope = Envelope {
                from: peer.addr(),
                kind: frame.kind,
                payload: frame.payload,
            };
            if self.inbound_tx.send(envelope).await.is_err() {
                // consumer gone; nothing left to deliver to
                return Ok(());
            }

            if let Some(gate) = gate {
                match time::timeout(self.config.stream_wait, gate).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Ok(()),
                    Err(_) => {
                        warn!(
                            peer = %peer.addr(),
                            "stream hand-off timed out, closing connection"
                        );
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("listen_addr", &self.config.listen_addr)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}
