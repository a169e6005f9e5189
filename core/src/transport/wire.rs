//! Wire framing for peer traffic.
//!
//! Every control message travels as one frame: `[kind][len][payload]` with
//! a 4-byte big-endian length. Raw file payloads are deliberately NOT
//! framed — a stream-bearing control message declares how many raw bytes
//! follow on the connection, and the read loop parks while the node
//! consumes them (see [`super::tcp`]).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size in bytes: 1 byte kind + 4 byte length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Parsed frame view over a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Message kind byte.
    pub kind: u8,
    /// Frame payload.
    pub payload: &'a [u8],
    /// Total frame size (header + payload).
    pub total_size: usize,
}

/// An owned frame read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    /// Message kind byte.
    pub kind: u8,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Errors when encoding or decoding a frame.
#[derive(Debug)]
pub enum FrameError {
    /// Input does not contain a full frame.
    TooShort,
    /// Trailing bytes after a complete frame.
    TrailingBytes,
    /// Declared payload length exceeds the configured maximum.
    TooLarge { len: usize, max: usize },
    /// Socket error while reading or writing.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "frame too short"),
            FrameError::TrailingBytes => write!(f, "trailing bytes after frame"),
            FrameError::TooLarge { len, max } => {
                write!(f, "frame payload of {len} bytes exceeds maximum of {max}")
            }
            FrameError::Io(e) => write!(f, "frame io error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Encode a framed message as `[kind][len][payload]`.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    bytes.push(kind);
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Decode a frame from bytes. Returns the frame and total bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort);
    }

    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let total_size = FRAME_HEADER_LEN + len;

    if bytes.len() < total_size {
        return Err(FrameError::TooShort);
    }

    Ok(Frame {
        kind: bytes[0],
        payload: &bytes[FRAME_HEADER_LEN..total_size],
        total_size,
    })
}

/// Decode a frame and require that it consumes the full buffer.
pub fn decode_frame_exact(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    let frame = decode_frame(bytes)?;
    if frame.total_size != bytes.len() {
        return Err(FrameError::TrailingBytes);
    }
    Ok(frame)
}

/// Frame codec with an explicit size limit.
///
/// Constructed once and handed to the transport — decoding rules are
/// per-instance, never process-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl FrameCodec {
    /// Create a codec that rejects payloads longer than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// The configured payload limit.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Read exactly one frame off `reader`.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<OwnedFrame, FrameError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let kind = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(OwnedFrame { kind, payload })
    }

    /// Write one frame to `writer`.
    pub async fn write_frame<W>(
        &self,
        writer: &mut W,
        kind: u8,
        payload: &[u8],
    ) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if payload.len() > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        writer.write_all(&encode_frame(kind, payload)).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_roundtrip() {
        let bytes = encode_frame(0x01, b"hello");
        let frame = decode_frame_exact(&bytes).unwrap();
        assert_eq!(frame.kind, 0x01);
        assert_eq!(frame.payload, b"hello");
        assert_eq!(frame.total_size, FRAME_HEADER_LEN + 5);
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(matches!(decode_frame(b"\x01\x00"), Err(FrameError::TooShort)));

        // header present, payload truncated
        let mut bytes = encode_frame(0x01, b"hello");
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(decode_frame(&bytes), Err(FrameError::TooShort)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_frame(0x02, b"payload");
        bytes.push(0xff);
        assert!(matches!(
            decode_frame_exact(&bytes),
            Err(FrameError::TrailingBytes)
        ));
        // the relaxed decoder still parses the leading frame
        assert!(decode_frame(&bytes).is_ok());
    }

    #[tokio::test]
    async fn async_roundtrip_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let codec = FrameCodec::default();

        codec.write_frame(&mut client, 0x07, b"abc").await.unwrap();
        codec.write_frame(&mut client, 0x08, b"").await.unwrap();

        let first = codec.read_frame(&mut server).await.unwrap();
        assert_eq!(first.kind, 0x07);
        assert_eq!(first.payload, b"abc");

        let second = codec.read_frame(&mut server).await.unwrap();
        assert_eq!(second.kind, 0x08);
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn oversize_frames_are_rejected_on_both_sides() {
        let codec = FrameCodec::new(4);

        let (mut client, mut server) = tokio::io::duplex(1024);
        let err = codec
            .write_frame(&mut client, 0x01, b"too long")
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 8, max: 4 }));

        // a peer ignoring the limit gets cut off at decode
        use tokio::io::AsyncWriteExt;
        client.write_all(&encode_frame(0x01, b"too long")).await.unwrap();
        let err = codec.read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 8, max: 4 }));
    }

    #[tokio::test]
    async fn closed_stream_surfaces_io_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let codec = FrameCodec::default();
        let err = codec.read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
