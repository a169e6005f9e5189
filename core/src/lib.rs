//! Driftwood
//!
//! A peer-to-peer content-addressable file store. Every node persists
//! files under hash-derived paths and replicates stored payloads to its
//! connected peers over a framed TCP protocol; any connected node ends up
//! holding the bytes, addressable by the same key.
//!
//! # Module Structure
//!
//! - `config`: node configuration surface
//! - `error`: crate error type
//! - `store/`: content-addressable disk storage (hash-sharded paths)
//! - `transport/`: TCP framing, control messages, connection handling
//! - `node/`: the file server — registry, dispatch loop, replication
//! - `testing`: multi-node test helpers
//!
//! # Quick Start
//!
//! ```ignore
//! use driftwood_core::{Node, NodeConfig};
//!
//! // First node of a network
//! let config = NodeConfig::new("127.0.0.1:3000".parse()?, "./data");
//! let node = Node::start(config).await?;
//!
//! // Store locally and replicate to every connected peer
//! node.store("myprivatedata", &mut &b"my big data file here!"[..]).await?;
//!
//! // Retrieve by key
//! let bytes = node.read_bytes("myprivatedata").await?;
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod store;
pub mod testing;
pub mod transport;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::Node;
pub use store::{PathKey, PathScheme, Store};
pub use transport::{ControlMessage, Envelope, FrameCodec, TcpTransport};
