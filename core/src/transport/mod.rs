//! Peer transport: wire framing, control messages, and TCP connection
//! handling.
//!
//! - `wire`: `[kind][len][payload]` frame codec
//! - `message`: the tagged control-message union
//! - `tcp`: listener, dialer, per-connection read loops, stream hand-off

pub mod message;
pub mod tcp;
pub mod wire;

pub use message::{
    ControlMessage, DecodeError, MessageKind, StoreFileMessage, StreamDataMessage,
    StreamReadyMessage,
};
pub use tcp::{
    Direction, Envelope, Handshake, NoopHandshake, PeerCallback, PeerRejected, TcpPeer,
    TcpTransport, TcpTransportConfig,
};
pub use wire::{FrameCodec, FrameError};
