//! Test utilities: real nodes on loopback with throwaway storage roots.
//!
//! [`TestCluster`] starts N nodes on ephemeral ports; every node after the
//! first bootstraps to the first node's address. Storage roots live under
//! the OS temp directory and are removed when the cluster drops.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::node::Node;

/// A handful of real nodes wired together over loopback.
pub struct TestCluster {
    nodes: Vec<Node>,
    roots: Vec<PathBuf>,
}

impl TestCluster {
    /// Start `count` nodes. Node 0 is the seed; every other node gets
    /// node 0 as its bootstrap address.
    pub async fn start(count: usize) -> Result<Self, NodeError> {
        let mut nodes = Vec::with_capacity(count);
        let mut roots = Vec::with_capacity(count);
        let mut seed: Option<SocketAddr> = None;

        for i in 0..count {
            let root = unique_root(i);
            let mut config = NodeConfig::for_testing(&root);
            if let Some(addr) = seed {
                config.bootstrap_nodes.push(addr);
            }

            let node = Node::start(config).await?;
            if seed.is_none() {
                seed = node.local_addr();
            }
            nodes.push(node);
            roots.push(root);
        }

        Ok(Self { nodes, roots })
    }

    /// The `index`-th node.
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Number of nodes in the cluster.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wait until every node's registry holds at least `expected` peers.
    pub async fn wait_connected(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = time::Instant::now() + timeout;
        loop {
            let mut all_connected = true;
            for node in &self.nodes {
                if node.peer_count().await < expected {
                    all_connected = false;
                    break;
                }
            }
            if all_connected {
                return true;
            }
            if time::Instant::now() >= deadline {
                return false;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.stop();
        }
        for root in &self.roots {
            let _ = std::fs::remove_dir_all(root);
        }
    }
}

/// Poll `probe` until it returns true or the timeout elapses.
pub async fn wait_for<F, Fut>(mut probe: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

fn unique_root(index: usize) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "driftwood-test-{}-{}-{}",
        std::process::id(),
        nanos,
        index
    ))
}
