//! Body decompression and re-framing.
//!
//! The server batches chat commands: one outer `SendMessage` frame carries a zlib or
//! Brotli stream whose plaintext is itself a run of concatenated frames. [`Unpacker`]
//! flattens that into the plain frames a caller cares about, in wire order.

use std::io::Read;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use tracing::{trace, warn};

use crate::error::{DanmakuError, Result};
use crate::packet::{FrameHeader, ProtocolVersion, split_frames};

/// How many compressed layers are opened. The server never nests deeper than one.
pub const MAX_REFRAME_DEPTH: usize = 1;

/// Upper bound on a single decompressed body.
const MAX_DECOMPRESSED_LEN: u64 = 16 * 1024 * 1024;

/// Result of decoding one frame body.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodedPayload<'a> {
    /// Protocol 0/1: the body is the payload.
    Raw(&'a [u8]),
    /// Protocol 2/3: decompressed bytes that must be split into frames again.
    Reframe(Vec<u8>),
}

/// Decode a frame body according to its protocol tag.
pub fn decode(protocol_version: u16, body: &[u8]) -> Result<DecodedPayload<'_>> {
    let version = ProtocolVersion::try_from(protocol_version)
        .map_err(DanmakuError::UnsupportedProtocolVersion)?;

    match version {
        ProtocolVersion::Json | ProtocolVersion::Raw => Ok(DecodedPayload::Raw(body)),
        ProtocolVersion::Zlib => decompress_zlib(body).map(DecodedPayload::Reframe),
        ProtocolVersion::Brotli => decompress_brotli(body).map(DecodedPayload::Reframe),
    }
}

/// Decompress zlib data.
fn decompress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    read_bounded(ZlibDecoder::new(data), "zlib")
}

/// Decompress brotli data.
fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>> {
    read_bounded(brotli::Decompressor::new(data, 4096), "brotli")
}

fn read_bounded(reader: impl Read, codec: &str) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    reader
        .take(MAX_DECOMPRESSED_LEN + 1)
        .read_to_end(&mut decompressed)
        .map_err(|e| DanmakuError::Decompress(format!("{codec} decompression failed: {e}")))?;

    if decompressed.len() as u64 > MAX_DECOMPRESSED_LEN {
        return Err(DanmakuError::Decompress(format!(
            "{codec} payload exceeds {MAX_DECOMPRESSED_LEN} bytes"
        )));
    }
    Ok(decompressed)
}

/// A fully decoded frame: never compressed, body ready for the next stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: FrameHeader,
    pub body: Bytes,
}

/// Position inside one buffer being split.
struct Cursor {
    buf: Bytes,
    offset: usize,
    depth: usize,
}

enum Step {
    Emit(Packet),
    Descend(Bytes),
    Skip,
    Exhausted,
}

/// Flattens inbound socket messages into plain packets.
///
/// Works on an explicit stack of cursors instead of recursing, so a hostile payload
/// cannot grow the call stack. Every problem is local: a bad frame ends that buffer,
/// a bad compressed body is dropped, and everything else still comes out.
#[derive(Debug, Clone, Copy)]
pub struct Unpacker {
    max_depth: usize,
}

impl Default for Unpacker {
    fn default() -> Self {
        Self {
            max_depth: MAX_REFRAME_DEPTH,
        }
    }
}

impl Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the nesting cap (mainly for tests).
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Split `data` and open any compressed command frames inside it.
    pub fn unpack(&self, data: Bytes) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut stack = vec![Cursor {
            buf: data,
            offset: 0,
            depth: 0,
        }];

        while let Some(cursor) = stack.last_mut() {
            match self.step(cursor) {
                Step::Emit(packet) => packets.push(packet),
                Step::Descend(buf) => {
                    let depth = cursor.depth + 1;
                    stack.push(Cursor {
                        buf,
                        offset: 0,
                        depth,
                    });
                }
                Step::Skip => {}
                Step::Exhausted => {
                    stack.pop();
                }
            }
        }

        packets
    }

    fn step(&self, cursor: &mut Cursor) -> Step {
        let frame = match split_frames(&cursor.buf[cursor.offset..]).next() {
            None => return Step::Exhausted,
            Some(Err(e)) => {
                warn!(depth = cursor.depth, "Dropping rest of buffer: {}", e);
                return Step::Exhausted;
            }
            Some(Ok(frame)) => frame,
        };

        let header = frame.header;
        let body_start = cursor.offset + header.header_length as usize;
        let body_end = cursor.offset + header.total_length as usize;
        cursor.offset = body_end;

        trace!(
            operation = ?header.operation,
            protocol_version = header.protocol_version,
            length = header.total_length,
            depth = cursor.depth,
            "Frame"
        );

        if !header.operation.carries_commands() {
            return Step::Emit(Packet {
                header,
                body: cursor.buf.slice(body_start..body_end),
            });
        }

        match decode(header.protocol_version, frame.body) {
            Ok(DecodedPayload::Raw(_)) => Step::Emit(Packet {
                header,
                body: cursor.buf.slice(body_start..body_end),
            }),
            Ok(DecodedPayload::Reframe(inner)) => {
                if cursor.depth >= self.max_depth {
                    warn!(
                        depth = cursor.depth,
                        "Dropping compressed frame nested deeper than {}", self.max_depth
                    );
                    return Step::Skip;
                }
                Step::Descend(Bytes::from(inner))
            }
            Err(e) => {
                warn!("Dropping frame: {}", e);
                Step::Skip
            }
        }
    }
}
