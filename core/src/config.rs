//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::DEFAULT_SEGMENT_LEN;
use crate::transport::wire::DEFAULT_MAX_FRAME_LEN;

/// Configuration for a driftwood node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the transport listens on.
    pub listen_addr: SocketAddr,

    /// Root directory of the content-addressable store.
    pub storage_root: PathBuf,

    /// Peers dialed on startup. Best-effort: a failed dial is logged and
    /// ignored.
    pub bootstrap_nodes: Vec<SocketAddr>,

    /// Width of one shard path segment, in hex characters.
    /// Default: 5 (a SHA-1 digest splits into 8 segments)
    pub segment_len: usize,

    /// Upper bound on a single control frame's payload, in bytes.
    /// Default: 64 KiB
    pub max_frame_len: usize,

    /// Capacity of the shared inbound message channel.
    /// Default: 64
    pub inbound_capacity: usize,

    /// How long a parked read loop waits for its announced raw stream to
    /// be consumed before the connection is closed (seconds).
    /// Default: 30
    pub stream_wait_secs: u64,

    /// How long the replication path waits for a peer's stream-ready ack
    /// before giving up on that transfer (seconds).
    /// Default: 10
    pub ready_wait_secs: u64,
}

impl NodeConfig {
    /// Config with defaults for everything but the listen address and
    /// storage root.
    pub fn new(listen_addr: SocketAddr, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            storage_root: storage_root.into(),
            bootstrap_nodes: Vec::new(),
            segment_len: DEFAULT_SEGMENT_LEN,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            inbound_capacity: 64,
            stream_wait_secs: 30,
            ready_wait_secs: 10,
        }
    }

    /// Config for tests: ephemeral loopback port, short timeouts.
    pub fn for_testing(storage_root: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(
            "127.0.0.1:0".parse().expect("loopback address parses"),
            storage_root,
        );
        config.stream_wait_secs = 5;
        config.ready_wait_secs = 5;
        config
    }

    /// Stream hand-off park bound as a [`Duration`].
    pub fn stream_wait(&self) -> Duration {
        Duration::from_secs(self.stream_wait_secs)
    }

    /// Replication readiness bound as a [`Duration`].
    pub fn ready_wait(&self) -> Duration {
        Duration::from_secs(self.ready_wait_secs)
    }
}
