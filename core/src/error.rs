//! Node errors.

use std::net::SocketAddr;

/// Errors surfaced by a driftwood node.
#[derive(Debug)]
pub enum NodeError {
    /// The transport failed to start or was unusable.
    Transport(String),
    /// Local store I/O error.
    Io(String),
    /// Key not present in the local store.
    NotFound(String),
    /// A message referenced a peer that is not in the registry.
    PeerNotFound(SocketAddr),
    /// Replication to a peer failed. Peers contacted earlier in the same
    /// broadcast may already hold the payload.
    Replication { peer: SocketAddr, reason: String },
    /// An inbound raw-byte transfer from a peer failed.
    Stream { peer: SocketAddr, reason: String },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Transport(e) => write!(f, "transport error: {e}"),
            NodeError::Io(e) => write!(f, "io error: {e}"),
            NodeError::NotFound(key) => write!(f, "key not found: {key}"),
            NodeError::PeerNotFound(addr) => write!(f, "peer not found in registry: {addr}"),
            NodeError::Replication { peer, reason } => {
                write!(f, "replication to {peer} failed: {reason}")
            }
            NodeError::Stream { peer, reason } => {
                write!(f, "stream transfer from {peer} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_descriptive() {
        let err = NodeError::NotFound("mybestpicture".to_string());
        assert_eq!(err.to_string(), "key not found: mybestpicture");

        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let err = NodeError::PeerNotFound(addr);
        assert_eq!(
            err.to_string(),
            "peer not found in registry: 127.0.0.1:3000"
        );

        let err = NodeError::Replication {
            peer: addr,
            reason: "timed out".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "replication to 127.0.0.1:3000 failed: timed out"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = NodeError::from(io);
        assert!(matches!(err, NodeError::Io(_)));
        assert!(err.to_string().contains("disk on fire"));
    }
}
