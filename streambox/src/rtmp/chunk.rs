//! RTMP chunk layer: header compression state per chunk stream, splitting of
//! outgoing messages, and reassembly of incoming ones.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::rtmp::RtmpError;

const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

/// Per-chunk-stream header state on the sending side.
#[derive(Debug, Default, Clone)]
struct OutgoingStream {
    timestamp: u32,
    active: bool,
    msid: u32,
}

/// Encodes messages into chunks, compressing headers against the previous
/// message on the same chunk stream.
pub struct ChunkWriter {
    chunk_size: usize,
    streams: HashMap<u8, OutgoingStream>,
}

impl ChunkWriter {
    pub fn new(chunk_size: usize) -> Self {
        ChunkWriter {
            chunk_size,
            streams: HashMap::new(),
        }
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
    }

    /// Serialises one message onto `out` as a type 0 or type 1 chunk followed
    /// by type 3 continuation chunks.
    ///
    /// The first message on a chunk stream (or one that changes the message
    /// stream id) carries an absolute timestamp; later ones carry a delta.
    /// A timestamp that runs backwards is clamped to a zero delta so the
    /// stream stays monotone.
    ///
    /// Returns the timestamp recorded for the chunk stream.
    pub fn write_message(
        &mut self,
        out: &mut BytesMut,
        csid: u8,
        type_id: u8,
        msid: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> u32 {
        debug_assert!((2..64).contains(&csid));

        let state = self.streams.entry(csid).or_default();
        let length = payload.len() as u32;

        let recorded = if !state.active || state.msid != msid {
            out.put_u8(csid); // fmt 0
            put_u24(out, timestamp.min(EXTENDED_TIMESTAMP));
            put_u24(out, length);
            out.put_u8(type_id);
            out.put_u32_le(msid);
            if timestamp >= EXTENDED_TIMESTAMP {
                out.put_u32(timestamp);
            }
            timestamp
        } else {
            let delta = timestamp.saturating_sub(state.timestamp);
            out.put_u8(0x40 | csid); // fmt 1
            put_u24(out, delta.min(EXTENDED_TIMESTAMP));
            put_u24(out, length);
            out.put_u8(type_id);
            if delta >= EXTENDED_TIMESTAMP {
                out.put_u32(delta);
            }
            state.timestamp + delta
        };

        state.active = true;
        state.timestamp = recorded;
        state.msid = msid;

        let mut chunks = payload.chunks(self.chunk_size);
        if let Some(first) = chunks.next() {
            out.put_slice(first);
        }
        for chunk in chunks {
            out.put_u8(0xC0 | csid); // fmt 3 continuation
            out.put_slice(chunk);
        }

        recorded
    }
}

/// A fully reassembled message received from the server.
#[derive(Debug, Clone)]
pub struct RtmpMessage {
    pub type_id: u8,
    pub msid: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct IncomingStream {
    timestamp: u32,
    delta: u32,
    length: u32,
    type_id: u8,
    msid: u32,
    extended: bool,
    buffer: BytesMut,
}

/// Reassembles the server's chunk stream into messages.
///
/// The publisher only ever drains control messages and command replies, but
/// the reader still handles every header format, multi-byte chunk stream ids,
/// extended timestamps and interleaving, so a chatty server cannot
/// desynchronise the connection.
pub struct ChunkReader {
    chunk_size: usize,
    streams: HashMap<u16, IncomingStream>,
    buf: BytesMut,
}

impl ChunkReader {
    pub fn new(chunk_size: usize) -> Self {
        ChunkReader {
            chunk_size,
            streams: HashMap::new(),
            buf: BytesMut::new(),
        }
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Parses as far as the buffered input allows and returns the next
    /// complete message, or `None` until more input arrives.
    pub fn next_message(&mut self) -> Result<Option<RtmpMessage>, RtmpError> {
        while let Some((consumed, message)) = self.parse_chunk()? {
            self.buf.advance(consumed);
            if message.is_some() {
                return Ok(message);
            }
        }

        Ok(None)
    }

    /// Attempts to parse a single chunk from the front of the buffer without
    /// consuming anything. Returns the number of bytes the chunk occupies and
    /// the message it completed, if any.
    #[allow(clippy::type_complexity)]
    fn parse_chunk(&mut self) -> Result<Option<(usize, Option<RtmpMessage>)>, RtmpError> {
        let buf = &self.buf[..];
        if buf.is_empty() {
            return Ok(None);
        }

        let fmt = buf[0] >> 6;
        let (csid, mut pos) = match buf[0] & 0x3F {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (64 + buf[1] as u16, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (64 + buf[1] as u16 + 256 * buf[2] as u16, 3)
            }
            n => (n as u16, 1),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < pos + header_len {
            return Ok(None);
        }
        let header = &buf[pos..pos + header_len];
        pos += header_len;

        let state = self.streams.entry(csid).or_default();
        let starting = fmt < 3 || state.buffer.is_empty();

        // Resolve the header against the previous message on this stream.
        let (timestamp, delta, length, type_id, msid, extended);
        match fmt {
            0 => {
                let ts = get_u24(&header[0..3]);
                length = get_u24(&header[3..6]);
                type_id = header[6];
                msid = u32::from_le_bytes(header[7..11].try_into().unwrap());
                extended = ts == EXTENDED_TIMESTAMP;
                delta = 0;
                timestamp = if extended {
                    match read_u32(buf, &mut pos) {
                        Some(ts) => ts,
                        None => return Ok(None),
                    }
                } else {
                    ts
                };
            }
            1 | 2 => {
                let field = get_u24(&header[0..3]);
                if fmt == 1 {
                    length = get_u24(&header[3..6]);
                    type_id = header[6];
                } else {
                    length = state.length;
                    type_id = state.type_id;
                }
                msid = state.msid;
                extended = field == EXTENDED_TIMESTAMP;
                delta = if extended {
                    match read_u32(buf, &mut pos) {
                        Some(delta) => delta,
                        None => return Ok(None),
                    }
                } else {
                    field
                };
                timestamp = state.timestamp.wrapping_add(delta);
            }
            _ => {
                length = state.length;
                type_id = state.type_id;
                msid = state.msid;
                extended = state.extended;
                if extended && read_u32(buf, &mut pos).is_none() {
                    return Ok(None);
                }
                delta = state.delta;
                timestamp = if starting {
                    state.timestamp.wrapping_add(delta)
                } else {
                    state.timestamp
                };
            }
        }

        if fmt < 3 && !state.buffer.is_empty() {
            return Err(RtmpError::BadChunk(format!(
                "type {fmt} chunk interrupts a message on chunk stream {csid}"
            )));
        }

        let received = if starting { 0 } else { state.buffer.len() };
        let chunk_len = self.chunk_size.min(length as usize - received);
        if buf.len() < pos + chunk_len {
            return Ok(None);
        }

        // The whole chunk is available; commit the state transition.
        state.timestamp = timestamp;
        state.delta = delta;
        state.length = length;
        state.type_id = type_id;
        state.msid = msid;
        state.extended = extended;
        state.buffer.extend_from_slice(&buf[pos..pos + chunk_len]);

        let message = if state.buffer.len() == length as usize {
            let payload = std::mem::take(&mut state.buffer).freeze();
            Some(RtmpMessage {
                type_id,
                msid,
                timestamp,
                payload,
            })
        } else {
            None
        };

        Ok(Some((pos + chunk_len, message)))
    }
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u8((value >> 8) as u8);
    out.put_u8(value as u8);
}

fn get_u24(raw: &[u8]) -> u32 {
    (raw[0] as u32) << 16 | (raw[1] as u32) << 8 | raw[2] as u32
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    if buf.len() < *pos + 4 {
        return None;
    }
    let value = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Some(value)
}
