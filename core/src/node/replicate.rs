//! Replication: pushing a locally stored file to every connected peer.
//!
//! The transfer protocol per peer:
//!
//! 1. send `StoreFile { key, size }`
//! 2. wait for that peer's `StreamReady { key }` (bounded)
//! 3. write the `StreamData` marker and the payload bytes back-to-back
//!    under the peer's write lock
//!
//! The explicit readiness ack means the payload is only ever pushed at a
//! peer that has seen the announcement; there is no timing assumption
//! anywhere in the path.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::transport::message::ControlMessage;
use crate::transport::tcp::TcpPeer;
use crate::transport::wire::encode_frame;

use super::NodeInner;

impl NodeInner {
    /// Replicate `key` (already in the local store, `size` bytes) to every
    /// registered peer.
    ///
    /// Peers are fed sequentially from a registry snapshot; the first
    /// failure aborts the call, so partial delivery is possible.
    pub(crate) async fn replicate(&self, key: &str, size: u64) -> Result<(), NodeError> {
        let peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        if peers.is_empty() {
            debug!(key = %key, "no peers to replicate to");
            return Ok(());
        }

        let ready: Vec<_> = peers
            .iter()
            .map(|peer| self.register_ready(peer.addr(), key))
            .collect();

        let result = self.replicate_to(key, size, &peers, ready).await;
        if result.is_err() {
            // waiters for peers we never reached would otherwise linger
            self.clear_ready_for_key(key);
        }
        result
    }

    async fn replicate_to(
        &self,
        key: &str,
        size: u64,
        peers: &[Arc<TcpPeer>],
        ready: Vec<oneshot::Receiver<()>>,
    ) -> Result<(), NodeError> {
        let (kind, payload) = ControlMessage::store_file(key, size).encode();
        let announcement = encode_frame(kind, &payload);

        for peer in peers {
            peer.send(&announcement)
                .await
                .map_err(|e| NodeError::Replication {
                    peer: peer.addr(),
                    reason: e.to_string(),
                })?;
        }

        for (peer, ready) in peers.iter().zip(ready) {
            match time::timeout(self.config.ready_wait(), ready).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(NodeError::Replication {
                        peer: peer.addr(),
                        reason: "peer disconnected before signaling readiness".to_string(),
                    });
                }
                Err(_) => {
                    return Err(NodeError::Replication {
                        peer: peer.addr(),
                        reason: "timed out waiting for stream-ready".to_string(),
                    });
                }
            }

            let (mut file, _) = self.store.read(key).await?;
            let (kind, payload) = ControlMessage::stream_data(key, size).encode();
            let marker = encode_frame(kind, &payload);
            let sent = peer
                .send_with_stream(&marker, &mut file)
                .await
                .map_err(|e| NodeError::Replication {
                    peer: peer.addr(),
                    reason: e.to_string(),
                })?;
            debug!(peer = %peer.addr(), key = %key, sent, "pushed payload");
        }

        info!(key = %key, size, peers = peers.len(), "replicated file");
        Ok(())
    }

    /// Register a waiter for a peer's `StreamReady { key }`.
    pub(crate) fn register_ready(&self, addr: SocketAddr, key: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_ready
            .lock()
            .expect("pending ready lock poisoned")
            .insert((addr, key.to_string()), tx);
        rx
    }

    /// Resolve a `StreamReady` to the transfer waiting on it.
    pub(crate) fn complete_ready(&self, addr: SocketAddr, key: &str) {
        let waiter = self
            .pending_ready
            .lock()
            .expect("pending ready lock poisoned")
            .remove(&(addr, key.to_string()));
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => warn!(peer = %addr, key = %key, "unexpected stream-ready"),
        }
    }

    /// Drop every waiter keyed to `key`, whichever peer it targets.
    fn clear_ready_for_key(&self, key: &str) {
        self.pending_ready
            .lock()
            .expect("pending ready lock poisoned")
            .retain(|(_, k), _| k != key);
    }

    /// Drop every waiter tied to a disconnected peer, so in-flight
    /// transfers fail fast instead of running out their timeouts.
    pub(crate) fn drop_waiters_for(&self, addr: SocketAddr) {
        self.pending_ready
            .lock()
            .expect("pending ready lock poisoned")
            .retain(|(a, _), _| *a != addr);
        self.pending_data
            .lock()
            .expect("pending data lock poisoned")
            .retain(|(a, _), _| *a != addr);
    }
}
