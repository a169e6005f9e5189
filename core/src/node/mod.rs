//! The file-server node.
//!
//! A [`Node`] owns the peer registry, the content-addressable store, and
//! the dispatch loop that consumes inbound control messages from the
//! transport. Storing a file writes it locally and replicates it to every
//! connected peer; an inbound transfer pulls the announced raw bytes off
//! the sending connection into the local store.
//!
//! Construction wires the node into the transport as its
//! [`PeerCallback`], so registry membership exactly tracks connections
//! that survived handshake and `on_peer`.

mod replicate;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::store::{PathScheme, Store};
use crate::transport::message::{ControlMessage, StoreFileMessage, StreamDataMessage};
use crate::transport::tcp::{
    Envelope, NoopHandshake, PeerCallback, PeerRejected, TcpPeer, TcpTransport,
    TcpTransportConfig,
};
use crate::transport::wire::{encode_frame, FrameCodec};

/// A running peer-to-peer file-store node.
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    config: NodeConfig,
    store: Store,
    transport: OnceLock<Arc<TcpTransport>>,
    peers: RwLock<HashMap<SocketAddr, Arc<TcpPeer>>>,
    /// Outbound transfers waiting for a peer's `StreamReady`, keyed by
    /// (peer, key).
    pending_ready: StdMutex<HashMap<(SocketAddr, String), oneshot::Sender<()>>>,
    /// Inbound transfers waiting for a peer's `StreamData` marker, keyed
    /// by (peer, key).
    pending_data: StdMutex<HashMap<(SocketAddr, String), oneshot::Sender<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Start a node: bind the transport, spawn the dispatch loop, and dial
    /// every bootstrap peer best-effort.
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        let store = Store::new(
            config.storage_root.clone(),
            PathScheme::new(config.segment_len),
        );
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            config: config.clone(),
            store,
            transport: OnceLock::new(),
            peers: RwLock::new(HashMap::new()),
            pending_ready: StdMutex::new(HashMap::new()),
            pending_data: StdMutex::new(HashMap::new()),
            shutdown_tx,
        });

        let transport_config = TcpTransportConfig {
            listen_addr: config.listen_addr,
            codec: FrameCodec::new(config.max_frame_len),
            stream_wait: config.stream_wait(),
            inbound_capacity: config.inbound_capacity,
        };
        let transport = TcpTransport::new(
            transport_config,
            Arc::new(NoopHandshake),
            Arc::clone(&inner) as Arc<dyn PeerCallback>,
        );
        let _ = inner.transport.set(Arc::clone(&transport));

        transport
            .listen_and_accept()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        let inbound = transport
            .consume()
            .ok_or_else(|| NodeError::Transport("inbound channel already taken".to_string()))?;
        let shutdown_rx = inner.shutdown_tx.subscribe();
        let dispatch = Arc::clone(&inner);
        tokio::spawn(async move {
            dispatch.dispatch_loop(inbound, shutdown_rx).await;
        });

        for addr in config.bootstrap_nodes {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                if let Err(e) = transport.dial(addr).await {
                    warn!(peer = %addr, error = %e, "bootstrap dial failed");
                }
            });
        }

        info!(
            addr = ?transport.local_addr(),
            root = %inner.store.root().display(),
            "node started"
        );
        Ok(Node { inner })
    }

    /// The transport's bound listen address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport().local_addr()
    }

    /// Number of connected peers in the registry.
    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Store `reader` under `key` locally, then replicate the payload to
    /// every connected peer.
    ///
    /// The first peer failure aborts the call; peers contacted earlier in
    /// the same broadcast may already hold the payload.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, NodeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let size = self.inner.store.write(key, reader).await?;
        debug!(key = %key, size, "stored locally");
        self.inner.replicate(key, size).await?;
        Ok(size)
    }

    /// Store `reader` under `key` locally without replicating.
    pub async fn store_local<R>(&self, key: &str, reader: &mut R) -> Result<u64, NodeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        Ok(self.inner.store.write(key, reader).await?)
    }

    /// Open the local file for `key`.
    pub async fn read(&self, key: &str) -> Result<(File, u64), NodeError> {
        match self.inner.store.read(key).await {
            Ok(pair) => Ok(pair),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(NodeError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the local file for `key` into memory.
    pub async fn read_bytes(&self, key: &str) -> Result<Vec<u8>, NodeError> {
        let (mut file, len) = self.read(key).await?;
        let mut buf = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buf).await.map_err(NodeError::from)?;
        Ok(buf)
    }

    /// Whether `key` exists in the local store.
    pub async fn has(&self, key: &str) -> bool {
        self.inner.store.has(key).await
    }

    /// Delete `key` from the local store.
    pub async fn delete(&self, key: &str) -> Result<(), NodeError> {
        match self.inner.store.delete(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(NodeError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the node: the dispatch loop closes the transport and exits.
    /// Idempotent.
    pub fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

impl NodeInner {
    fn transport(&self) -> &Arc<TcpTransport> {
        self.transport.get().expect("transport set during start")
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Envelope>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = inbound.recv() => match maybe {
                    Some(envelope) => Arc::clone(&self).handle_envelope(envelope),
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        self.transport().close();
        info!("node stopped");
    }

    /// Route one inbound envelope. Must never block the dispatch loop:
    /// anything that waits on the network runs in its own task.
    fn handle_envelope(self: Arc<Self>, envelope: Envelope) {
        let message = match ControlMessage::decode(envelope.kind, &envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %envelope.from, error = %e, "dropping undecodable message");
                return;
            }
        };

        let from = envelope.from;
        match message {
            ControlMessage::StoreFile(msg) => {
                tokio::spawn(async move {
                    if let Err(e) = self.handle_store_file(from, msg).await {
                        warn!(peer = %from, error = %e, "inbound store failed");
                    }
                });
            }
            ControlMessage::StreamReady(msg) => self.complete_ready(from, &msg.key),
            ControlMessage::StreamData(msg) => self.complete_data(from, msg),
        }
    }

    /// Accept an announced transfer from `from`: ack readiness, wait for
    /// the data marker, then pull exactly the announced bytes off the
    /// parked connection into the local store.
    async fn handle_store_file(
        &self,
        from: SocketAddr,
        msg: StoreFileMessage,
    ) -> Result<(), NodeError> {
        let peer = self
            .peers
            .read()
            .await
            .get(&from)
            .cloned()
            .ok_or(NodeError::PeerNotFound(from))?;

        let marker = self.register_data(from, &msg.key);

        let (kind, payload) = ControlMessage::stream_ready(&msg.key).encode();
        if let Err(e) = peer.send(&encode_frame(kind, &payload)).await {
            self.unregister_data(from, &msg.key);
            return Err(e.into());
        }

        match time::timeout(self.config.ready_wait(), marker).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                self.unregister_data(from, &msg.key);
                return Err(NodeError::Stream {
                    peer: from,
                    reason: "stream data never arrived".to_string(),
                });
            }
        }

        let stored = {
            // the marker parked the peer's read loop, so the read half is
            // free; hold it for the exact announced byte count
            let mut reader = peer.stream_reader().await;
            let mut chunk = (&mut *reader).take(msg.size);
            let result = self.store.write_sized(&msg.key, &mut chunk, msg.size).await;
            if result.is_err() && chunk.limit() > 0 {
                // keep framing aligned: discard what remains of the
                // announced stream before the read loop resumes
                let _ = tokio::io::copy(&mut chunk, &mut tokio::io::sink()).await;
            }
            result
        };
        peer.finish_stream();

        let size = stored?;
        info!(peer = %from, key = %msg.key, size, "stored replicated file");
        Ok(())
    }

    /// Resolve a `StreamData` marker to its waiting transfer, or drain an
    /// unmatched stream so the connection survives.
    fn complete_data(self: Arc<Self>, from: SocketAddr, msg: StreamDataMessage) {
        let waiter = self
            .pending_data
            .lock()
            .expect("pending data lock poisoned")
            .remove(&(from, msg.key.clone()));
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => {
                warn!(peer = %from, key = %msg.key, "unannounced stream data, draining");
                tokio::spawn(async move {
                    if let Err(e) = self.drain_stream(from, msg.size).await {
                        debug!(peer = %from, error = %e, "drain failed");
                    }
                });
            }
        }
    }

    /// Discard `size` raw bytes from a parked connection and release its
    /// read loop.
    async fn drain_stream(&self, from: SocketAddr, size: u64) -> Result<(), NodeError> {
        let peer = self
            .peers
            .read()
            .await
            .get(&from)
            .cloned()
            .ok_or(NodeError::PeerNotFound(from))?;

        {
            let mut reader = peer.stream_reader().await;
            let mut chunk = (&mut *reader).take(size);
            tokio::io::copy(&mut chunk, &mut tokio::io::sink())
                .await
                .map_err(NodeError::from)?;
        }
        peer.finish_stream();
        Ok(())
    }

    fn register_data(&self, addr: SocketAddr, key: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_data
            .lock()
            .expect("pending data lock poisoned")
            .insert((addr, key.to_string()), tx);
        rx
    }

    fn unregister_data(&self, addr: SocketAddr, key: &str) {
        self.pending_data
            .lock()
            .expect("pending data lock poisoned")
            .remove(&(addr, key.to_string()));
    }
}

impl PeerCallback for NodeInner {
    fn on_peer<'a>(&'a self, peer: Arc<TcpPeer>) -> BoxFuture<'a, Result<(), PeerRejected>> {
        Box::pin(async move {
            let addr = peer.addr();
            let mut peers = self.peers.write().await;
            peers.insert(addr, peer);
            info!(peer = %addr, total = peers.len(), "peer connected");
            Ok(())
        })
    }

    fn on_peer_closed<'a>(&'a self, addr: SocketAddr) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let removed = self.peers.write().await.remove(&addr).is_some();
            self.drop_waiters_for(addr);
            if removed {
                info!(peer = %addr, "peer disconnected");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, TestCluster};
    use std::time::Duration;
    use tokio::net::TcpStream;

    const REPLICATION_WAIT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn store_without_peers_stays_local() {
        let cluster = TestCluster::start(1).await.unwrap();
        let node = cluster.node(0);

        let written = node.store("alone", &mut &b"just me"[..]).await.unwrap();
        assert_eq!(written, 7);
        assert!(node.has("alone").await);
        assert_eq!(node.peer_count().await, 0);
        assert_eq!(node.read_bytes("alone").await.unwrap(), b"just me");
    }

    #[tokio::test]
    async fn store_replicates_to_a_connected_peer() {
        let cluster = TestCluster::start(2).await.unwrap();
        assert!(cluster.wait_connected(1, REPLICATION_WAIT).await);

        let data = b"my big data file here!";
        cluster
            .node(1)
            .store("myprivatedata", &mut &data[..])
            .await
            .unwrap();

        let replica = cluster.node(0);
        assert!(
            wait_for(
                || async { replica.has("myprivatedata").await },
                REPLICATION_WAIT
            )
            .await,
            "replica never received the file"
        );
        assert_eq!(replica.read_bytes("myprivatedata").await.unwrap(), data);
    }

    #[tokio::test]
    async fn store_broadcasts_to_every_peer() {
        let cluster = TestCluster::start(3).await.unwrap();
        // nodes 1 and 2 both bootstrap to node 0
        assert!(
            wait_for(
                || async { cluster.node(0).peer_count().await >= 2 },
                REPLICATION_WAIT
            )
            .await
        );

        let data = b"fan out to everyone";
        cluster.node(0).store("shared", &mut &data[..]).await.unwrap();

        for i in [1, 2] {
            let replica = cluster.node(i);
            assert!(
                wait_for(|| async { replica.has("shared").await }, REPLICATION_WAIT).await,
                "node {i} never received the file"
            );
            assert_eq!(replica.read_bytes("shared").await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn replicated_connection_still_decodes_after_the_stream() {
        let cluster = TestCluster::start(2).await.unwrap();
        assert!(cluster.wait_connected(1, REPLICATION_WAIT).await);

        // two stores over the same connection: the second only works if the
        // first stream left the framing intact
        cluster
            .node(1)
            .store("first", &mut &b"payload one"[..])
            .await
            .unwrap();
        cluster
            .node(1)
            .store("second", &mut &b"payload two, longer"[..])
            .await
            .unwrap();

        let replica = cluster.node(0);
        assert!(
            wait_for(
                || async { replica.has("first").await && replica.has("second").await },
                REPLICATION_WAIT
            )
            .await
        );
        assert_eq!(replica.read_bytes("first").await.unwrap(), b"payload one");
        assert_eq!(
            replica.read_bytes("second").await.unwrap(),
            b"payload two, longer"
        );
    }

    #[tokio::test]
    async fn concurrent_stores_in_both_directions_complete() {
        let cluster = TestCluster::start(2).await.unwrap();
        assert!(cluster.wait_connected(1, REPLICATION_WAIT).await);

        let a = cluster.node(0);
        let b = cluster.node(1);
        let mut payload_a = &b"payload going one way"[..];
        let mut payload_b = &b"payload going the other way"[..];
        let (from_a, from_b) = tokio::join!(
            a.store("from_a", &mut payload_a),
            b.store("from_b", &mut payload_b),
        );
        from_a.unwrap();
        from_b.unwrap();

        assert!(
            wait_for(
                || async { b.has("from_a").await && a.has("from_b").await },
                REPLICATION_WAIT
            )
            .await,
            "cross-replication did not converge"
        );
        assert_eq!(
            b.read_bytes("from_a").await.unwrap(),
            b"payload going one way"
        );
        assert_eq!(
            a.read_bytes("from_b").await.unwrap(),
            b"payload going the other way"
        );
    }

    #[tokio::test]
    async fn registry_tracks_connects_and_disconnects() {
        let cluster = TestCluster::start(1).await.unwrap();
        let node = cluster.node(0);
        let addr = node.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        assert!(
            wait_for(|| async { node.peer_count().await == 1 }, REPLICATION_WAIT).await,
            "peer never registered"
        );

        drop(client);
        assert!(
            wait_for(|| async { node.peer_count().await == 0 }, REPLICATION_WAIT).await,
            "registry kept a dead peer"
        );
    }

    #[tokio::test]
    async fn delete_and_missing_reads_report_not_found() {
        let cluster = TestCluster::start(1).await.unwrap();
        let node = cluster.node(0);

        assert!(matches!(
            node.read("ghost").await,
            Err(NodeError::NotFound(_))
        ));
        assert!(matches!(
            node.delete("ghost").await,
            Err(NodeError::NotFound(_))
        ));

        node.store_local("real", &mut &b"bytes"[..]).await.unwrap();
        node.delete("real").await.unwrap();
        assert!(!node.has("real").await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let cluster = TestCluster::start(1).await.unwrap();
        cluster.node(0).stop();
        cluster.node(0).stop();
    }
}
