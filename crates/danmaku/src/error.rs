//! Danmaku error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, DanmakuError>;

/// A frame could not be read from a buffer.
///
/// Always local to one read: the rest of that buffer is discarded and the
/// connection keeps going.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than 16 bytes left where a header was expected.
    #[error("truncated frame header: {available} bytes available")]
    Truncated { available: usize },

    /// The declared total length is below the header size or past the end of the buffer.
    #[error("invalid frame length {length} with {remaining} bytes remaining")]
    InvalidLength { length: u32, remaining: usize },

    /// The declared header length does not fit inside the frame.
    #[error("invalid header length {header_length} for frame of {total_length} bytes")]
    InvalidHeaderLength {
        header_length: u16,
        total_length: u32,
    },
}

/// Errors that can occur while collecting danmu from a live room.
#[derive(Error, Debug)]
pub enum DanmakuError {
    /// Truncated or corrupt frame
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Protocol tag outside 0..=3
    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u16),

    /// zlib/brotli stream could not be decoded
    #[error("Decompression failed: {0}")]
    Decompress(String),

    /// Message body is not a JSON command
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The server answered the handshake with a non-zero code
    #[error("Authentication rejected by server (code {code})")]
    AuthRejected { code: i64 },

    /// No handshake reply arrived in time
    #[error("Timed out waiting for handshake reply")]
    HandshakeTimeout,

    /// The socket closed or errored
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Reconnect attempts ran out
    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    /// The client was disposed
    #[error("Client has been disposed")]
    Disposed,

    /// Connection-related errors (WebSocket open, send)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Room/auth API returned something unusable
    #[error("API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DanmakuError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an API error.
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    /// Create a malformed payload error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }
}
