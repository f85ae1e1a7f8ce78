//! RTMP chunk stream framing
//!
//! Logical messages are multiplexed onto chunk streams with header
//! compression. Each chunk carries a basic header (1-3 bytes encoding
//! the format and the chunk stream id), a message header whose size
//! depends on the format, and up to one chunk size of payload.
//!
//! ```text
//! Basic header:
//! - 1 byte:  fmt(2) | csid(6)          csid 2-63
//! - 2 bytes: fmt(2) | 0, csid-64       csid 64-319
//! - 3 bytes: fmt(2) | 1, (csid-64) LE  csid 64-65599
//!
//! Message header by format:
//! - fmt 0 (11 bytes): timestamp(3) length(3) type(1) stream_id(4, LE)
//! - fmt 1 (7 bytes):  timestamp_delta(3) length(3) type(1)
//! - fmt 2 (3 bytes):  timestamp_delta(3)
//! - fmt 3 (0 bytes):  everything from the previous chunk
//! ```
//!
//! A 4-byte extended timestamp follows a fmt 0 header whose 24-bit field
//! saturates at 0xFFFFFF. The message stream id is the only
//! little-endian field in RTMP.
//!
//! The specification contradicts itself on fmt 3 timestamp deltas: the
//! example in §5.3.2.1 applies the cached delta, the one in §5.3.2.2
//! does not. The policy here is that the delta applies only when the
//! fmt 3 chunk starts a new message, not when it continues a split one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// Per-chunk-stream header compression and reassembly state.
///
/// When `len_remaining` is zero the state is purely historical context
/// for header compression; no partial message is outstanding.
#[derive(Debug, Clone, Default)]
struct ChunkStreamState {
    timestamp: u32,
    timestamp_delta: u32,
    msg_len: u32,
    msg_type: u8,
    msg_stream_id: u32,
    len_remaining: u32,
    msg_buffer: BytesMut,
}

/// A fully reassembled inbound message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub csid: u32,
    pub msg_stream_id: u32,
    pub msg_type: u8,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Result of consuming one chunk from the input buffer.
#[derive(Debug)]
pub struct ChunkRead {
    /// Header + payload bytes consumed, for acknowledgement accounting
    pub consumed: usize,
    /// Present when this chunk completed a message
    pub message: Option<InboundMessage>,
}

/// Outbound chunk framing with per-stream header compression.
pub struct ChunkWriter {
    max_chunk_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Set the outbound chunk size. Takes effect from the next message;
    /// the caller is responsible for having announced it with a
    /// SetChunkSize message first.
    pub fn set_max_chunk_size(&mut self, size: u32) {
        self.max_chunk_size = size.max(1);
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    /// Frame one logical message into `out`, split into chunks of at
    /// most the current chunk size, using the smallest header format the
    /// per-stream history allows.
    pub fn write_message(
        &mut self,
        out: &mut BytesMut,
        msg_stream_id: u32,
        msg_type: u8,
        timestamp: u32,
        payload: &[u8],
        csid: u32,
    ) -> Result<()> {
        if !(MIN_CHUNK_STREAM_ID..=MAX_CHUNK_STREAM_ID).contains(&csid) {
            return Err(ProtocolError::InvalidChunkStreamId(csid).into());
        }

        let max_chunk = self.max_chunk_size as usize;
        let is_new = !self.streams.contains_key(&csid);
        let state = self.streams.entry(csid).or_default();

        // Smallest format whose state delta is representable
        let mut fmt = 3u8;
        if state.timestamp_delta != timestamp.wrapping_sub(state.timestamp) {
            fmt = 2;
        }
        if state.msg_len != payload.len() as u32 || state.msg_type != msg_type {
            fmt = 1;
        }
        if is_new || timestamp == 0 || timestamp < state.timestamp
            || state.msg_stream_id != msg_stream_id
        {
            if !is_new && timestamp < state.timestamp && timestamp != 0 {
                // Servers are known to drop streams over this; see the
                // Wowza forums on backward timestamps in live streams.
                tracing::warn!(
                    was = state.timestamp,
                    now = timestamp,
                    "timestamp went back in time"
                );
            }
            fmt = 0;
        }

        match fmt {
            0 => {
                state.timestamp = timestamp;
                // RTMP quirk: a full header resets the delta to the timestamp
                state.timestamp_delta = timestamp;
                state.msg_len = payload.len() as u32;
                state.msg_type = msg_type;
                state.msg_stream_id = msg_stream_id;
            }
            1 => {
                state.timestamp_delta = timestamp.wrapping_sub(state.timestamp);
                state.timestamp = timestamp;
                state.msg_len = payload.len() as u32;
                state.msg_type = msg_type;
            }
            2 => {
                state.timestamp_delta = timestamp.wrapping_sub(state.timestamp);
                state.timestamp = timestamp;
            }
            _ => {}
        }

        let mut remaining = payload.len();
        let mut first = true;
        loop {
            let chunk_len = remaining.min(max_chunk);
            let offset = payload.len() - remaining;

            write_basic_header(out, if first { fmt } else { 3 }, csid);
            if first {
                match fmt {
                    0 => {
                        if state.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD {
                            put_u24(out, EXTENDED_TIMESTAMP_THRESHOLD);
                        } else {
                            put_u24(out, state.timestamp);
                        }
                        put_u24(out, state.msg_len);
                        out.put_u8(state.msg_type);
                        out.put_u32_le(state.msg_stream_id);
                        if state.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD {
                            out.put_u32(state.timestamp);
                        }
                    }
                    1 => {
                        put_u24(out, state.timestamp_delta);
                        put_u24(out, state.msg_len);
                        out.put_u8(state.msg_type);
                    }
                    2 => {
                        put_u24(out, state.timestamp_delta);
                    }
                    _ => {}
                }
            }

            out.put_slice(&payload[offset..offset + chunk_len]);
            remaining -= chunk_len;
            first = false;
            if remaining == 0 {
                break;
            }
        }

        tracing::trace!(
            msg_type,
            msg_stream_id,
            csid,
            len = payload.len(),
            fmt,
            "framed outbound message"
        );
        Ok(())
    }
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound chunk parsing and message reassembly.
pub struct ChunkReader {
    max_chunk_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Set the inbound chunk size (from a received SetChunkSize).
    pub fn set_max_chunk_size(&mut self, size: u32) {
        self.max_chunk_size = size.max(1);
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    /// Discard the partial reassembly on a chunk stream (Abort message).
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.msg_buffer.clear();
            state.len_remaining = 0;
        }
    }

    /// Consume one chunk from the front of `buf` if a whole one is
    /// present. Returns `None` when more data is needed; the buffer is
    /// only advanced once an entire chunk is available.
    pub fn read_chunk(&mut self, buf: &mut BytesMut) -> Option<ChunkRead> {
        if buf.is_empty() {
            return None;
        }

        let first = buf[0];
        let fmt = (first >> 6) & 0x03;
        let csid_low = (first & 0x3F) as u32;
        let (csid, basic_len) = match csid_low {
            0 => {
                if buf.len() < 2 {
                    return None;
                }
                (64 + buf[1] as u32, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return None;
                }
                (64 + buf[1] as u32 + buf[2] as u32 * 256, 3)
            }
            id => (id, 1),
        };

        let max_chunk = self.max_chunk_size;
        let state = self.streams.entry(csid).or_default();

        let mut header_len = basic_len;
        let mut implicit_abort = false;
        let starting_new;
        match fmt {
            0 => {
                if buf.len() < basic_len + 11 {
                    return None;
                }
                let mut timestamp = get_u24(&buf[basic_len..]);
                if timestamp >= EXTENDED_TIMESTAMP_THRESHOLD {
                    if buf.len() < basic_len + 15 {
                        return None;
                    }
                    timestamp = u32::from_be_bytes(
                        buf[basic_len + 11..basic_len + 15].try_into().expect("4 bytes"),
                    );
                    header_len = basic_len + 15;
                } else {
                    header_len = basic_len + 11;
                }
                state.timestamp = timestamp;
                state.timestamp_delta = timestamp; // Same reset quirk as the writer
                state.msg_len = get_u24(&buf[basic_len + 3..]);
                state.msg_type = buf[basic_len + 6];
                state.msg_stream_id = u32::from_le_bytes(
                    buf[basic_len + 7..basic_len + 11].try_into().expect("4 bytes"),
                );
                implicit_abort = state.len_remaining > 0;
                state.len_remaining = state.msg_len;
                starting_new = true;
            }
            1 => {
                if buf.len() < basic_len + 7 {
                    return None;
                }
                header_len = basic_len + 7;
                state.timestamp_delta = get_u24(&buf[basic_len..]);
                state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                state.msg_len = get_u24(&buf[basic_len + 3..]);
                state.msg_type = buf[basic_len + 6];
                implicit_abort = state.len_remaining > 0;
                state.len_remaining = state.msg_len;
                starting_new = true;
            }
            2 => {
                if buf.len() < basic_len + 3 {
                    return None;
                }
                header_len = basic_len + 3;
                state.timestamp_delta = get_u24(&buf[basic_len..]);
                state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                // Lenient: some peers use fmt 2 to zero the delta while
                // splitting a message into chunks.
                if state.len_remaining > 0 {
                    starting_new = false;
                } else {
                    state.len_remaining = state.msg_len;
                    starting_new = true;
                }
            }
            _ => {
                if state.len_remaining > 0 {
                    starting_new = false;
                } else {
                    // Brand-new message reusing every cached field; the
                    // cached delta advances the timestamp.
                    state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                    state.len_remaining = state.msg_len;
                    starting_new = true;
                }
            }
        }

        let chunk_len = state.len_remaining.min(max_chunk) as usize;
        if buf.len() < header_len + chunk_len {
            return None;
        }

        if implicit_abort {
            tracing::warn!(csid, "message aborted without an abort message");
        }
        if starting_new {
            state.msg_buffer.clear();
            state.msg_buffer.reserve(state.msg_len as usize);
        }

        buf.advance(header_len);
        state.msg_buffer.put_slice(&buf[..chunk_len]);
        buf.advance(chunk_len);
        state.len_remaining -= chunk_len as u32;

        let message = if state.len_remaining == 0 {
            Some(InboundMessage {
                csid,
                msg_stream_id: state.msg_stream_id,
                msg_type: state.msg_type,
                timestamp: state.timestamp,
                payload: state.msg_buffer.split().freeze(),
            })
        } else {
            None
        };

        Some(ChunkRead {
            consumed: header_len + chunk_len,
            message,
        })
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

fn write_basic_header(out: &mut BytesMut, fmt: u8, csid: u32) {
    if csid <= 63 {
        out.put_u8((fmt << 6) | csid as u8);
    } else if csid <= 319 {
        out.put_u8(fmt << 6);
        out.put_u8((csid - 64) as u8);
    } else {
        out.put_u8((fmt << 6) | 1);
        out.put_u8(((csid - 64) & 0xFF) as u8);
        out.put_u8(((csid - 64) >> 8) as u8);
    }
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u8((value >> 8) as u8);
    out.put_u8(value as u8);
}

fn get_u24(data: &[u8]) -> u32 {
    (data[0] as u32) << 16 | (data[1] as u32) << 8 | data[2] as u32
}
