//! Bilibili live chat frame codec.
//!
//! Every frame on the wire starts with a 16-byte big-endian header:
//!
//! ```text
//! 0        4        6        8        12       16
//! +--------+--------+--------+--------+--------+----------------+
//! | total  | header | proto  |   op   |  seq   | body ...       |
//! |  u32   |  u16   |  u16   |  u32   |  u32   |                |
//! +--------+--------+--------+--------+--------+----------------+
//! ```
//!
//! Nothing in this module performs I/O; it only reads and writes byte buffers.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Sequence number written into every outbound frame.
const SEQUENCE: u32 = 1;

/// Frame operation codes.
///
/// Values the client does not know about are kept as [`Operation::Unknown`]
/// so they can be skipped without failing the read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Heartbeat,
    HeartbeatReply,
    SendMessage,
    SendMessageReply,
    Handshake,
    HandshakeReply,
    DisconnectReply,
    Unknown(u32),
}

impl Operation {
    pub const fn code(self) -> u32 {
        match self {
            Self::Heartbeat => 2,
            Self::HeartbeatReply => 3,
            Self::SendMessage => 5,
            Self::SendMessageReply => 6,
            Self::Handshake => 7,
            Self::HandshakeReply => 8,
            Self::DisconnectReply => 9,
            Self::Unknown(code) => code,
        }
    }

    /// Whether frames with this operation carry chat commands.
    pub const fn carries_commands(self) -> bool {
        matches!(self, Self::SendMessage | Self::SendMessageReply)
    }
}

impl From<u32> for Operation {
    fn from(code: u32) -> Self {
        match code {
            2 => Self::Heartbeat,
            3 => Self::HeartbeatReply,
            5 => Self::SendMessage,
            6 => Self::SendMessageReply,
            7 => Self::Handshake,
            8 => Self::HandshakeReply,
            9 => Self::DisconnectReply,
            other => Self::Unknown(other),
        }
    }
}

/// Protocol tag selecting how a frame body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProtocolVersion {
    /// Raw UTF-8 JSON
    Json = 0,
    /// Raw body, used for handshake/heartbeat traffic
    Raw = 1,
    /// zlib stream of concatenated frames
    Zlib = 2,
    /// Brotli stream of concatenated frames
    Brotli = 3,
}

impl ProtocolVersion {
    pub const fn tag(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for ProtocolVersion {
    type Error = u16;

    fn try_from(tag: u16) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Json),
            1 => Ok(Self::Raw),
            2 => Ok(Self::Zlib),
            3 => Ok(Self::Brotli),
            other => Err(other),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_length: u32,
    pub header_length: u16,
    /// Raw protocol tag; see [`ProtocolVersion`] for the known values.
    pub protocol_version: u16,
    pub operation: Operation,
    pub sequence: u32,
}

impl FrameHeader {
    /// Number of body bytes following the header.
    pub fn body_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(self.header_length as usize)
    }
}

/// A header plus a borrowed view of its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub body: &'a [u8],
}

/// Encode a single frame.
pub fn encode(operation: Operation, body: &[u8], version: ProtocolVersion) -> Bytes {
    let total_length = HEADER_LEN + body.len();
    let mut buf = BytesMut::with_capacity(total_length);

    buf.put_u32(total_length as u32); // total length
    buf.put_u16(HEADER_LEN as u16); // header length
    buf.put_u16(version.tag()); // protocol version
    buf.put_u32(operation.code()); // operation
    buf.put_u32(SEQUENCE); // sequence
    buf.put_slice(body);

    buf.freeze()
}

/// Read the header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            available: data.len(),
        });
    }

    Ok(FrameHeader {
        total_length: BigEndian::read_u32(&data[0..4]),
        header_length: BigEndian::read_u16(&data[4..6]),
        protocol_version: BigEndian::read_u16(&data[6..8]),
        operation: Operation::from(BigEndian::read_u32(&data[8..12])),
        sequence: BigEndian::read_u32(&data[12..16]),
    })
}

/// Iterate over the frames concatenated in `data`.
///
/// The iterator yields at most one `Err`, for the first frame that is truncated or
/// has an impossible length, and then ends. Bytes after that point are dropped.
pub fn split_frames(data: &[u8]) -> FrameIter<'_> {
    FrameIter {
        data,
        offset: 0,
        done: false,
    }
}

/// Lazy iterator returned by [`split_frames`].
#[derive(Debug, Clone)]
pub struct FrameIter<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> FrameIter<'a> {
    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn next_frame(&mut self) -> Result<Frame<'a>, FrameError> {
        let rest = &self.data[self.offset..];
        let header = parse_header(rest)?;

        let total = header.total_length as usize;
        if total < HEADER_LEN || total > rest.len() {
            return Err(FrameError::InvalidLength {
                length: header.total_length,
                remaining: rest.len(),
            });
        }

        let header_len = header.header_length as usize;
        if header_len < HEADER_LEN || header_len > total {
            return Err(FrameError::InvalidHeaderLength {
                header_length: header.header_length,
                total_length: header.total_length,
            });
        }

        self.offset += total;
        Ok(Frame {
            header,
            body: &rest[header_len..total],
        })
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<Frame<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }

        match self.next_frame() {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for FrameIter<'_> {}
