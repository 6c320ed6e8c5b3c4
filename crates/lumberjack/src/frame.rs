// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lumberjack wire format.
//!
//! Every frame starts with a version byte (`'1'` or `'2'`) and a type byte,
//! followed by a type specific payload. Integers are big-endian `u32`.
//!
//! ```text
//! W  window      count
//! D  v1 data     seq, pairs, pairs * (klen, key, vlen, value)
//! J  v2 data     seq, len, payload
//! C  compressed  len, zlib(frames...)
//! A  ack         cumulative count
//! ```
//!
//! Decoding functions take the bytes received so far and return `Ok(None)`
//! when more input is needed; they never consume partial frames.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use tokio_util::codec::Decoder;

use crate::decoder::{Event, EventDecoder};
use crate::errors::{DecodeError, Error, Result};

pub const HEADER_LEN: usize = 2;
pub const ACK_FRAME_LEN: usize = 6;

const U32_LEN: usize = 4;

/// Largest length-prefixed payload accepted unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::V1 => b'1',
            Self::V2 => b'2',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(Self::V1),
            b'2' => Some(Self::V2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte() as char)
    }
}

/// Set of protocol versions a server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versions {
    pub v1: bool,
    pub v2: bool,
}

impl Default for Versions {
    fn default() -> Self {
        Self { v1: true, v2: true }
    }
}

impl Versions {
    pub const V2_ONLY: Versions = Versions {
        v1: false,
        v2: true,
    };

    pub fn contains(&self, version: Version) -> bool {
        match version {
            Version::V1 => self.v1,
            Version::V2 => self.v2,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.v1 && !self.v2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Window,
    Data,
    Json,
    Compressed,
    Ack,
}

impl FrameType {
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Window => b'W',
            Self::Data => b'D',
            Self::Json => b'J',
            Self::Compressed => b'C',
            Self::Ack => b'A',
        }
    }

    /// Resolves a type byte, honouring which types exist in `version`.
    pub fn for_version(byte: u8, version: Version) -> Option<Self> {
        match (byte, version) {
            (b'W', _) => Some(Self::Window),
            (b'C', _) => Some(Self::Compressed),
            (b'A', _) => Some(Self::Ack),
            (b'D', Version::V1) => Some(Self::Data),
            (b'J', Version::V2) => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Number of data frames forming the next batch.
    Window(u32),
    /// One decoded event and the sequence number the sender gave it.
    Data { seq: u32, event: Event },
    /// Payload of a compressed frame, not yet inflated.
    Compressed(Bytes),
    /// Cumulative acknowledged event count.
    Ack(u32),
}

fn peek_u32(src: &[u8], at: usize) -> Option<u32> {
    let bytes = src.get(at..at + U32_LEN)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn check_payload_len(len: usize, max_payload_size: usize) -> Result<()> {
    if len > max_payload_size {
        return Err(Error::protocol(format!(
            "payload of {len} bytes exceeds limit of {max_payload_size} bytes"
        )));
    }
    Ok(())
}

/// Reads the version and type bytes.
pub fn decode_frame_header(src: &[u8], versions: Versions) -> Result<Option<(Version, FrameType)>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let version = Version::from_byte(src[0])
        .filter(|v| versions.contains(*v))
        .ok_or_else(|| Error::protocol(format!("unsupported protocol version {:#04x}", src[0])))?;
    let frame_type = FrameType::for_version(src[1], version).ok_or_else(|| {
        Error::protocol(format!(
            "unknown frame type {:#04x} for protocol {version}",
            src[1]
        ))
    })?;
    Ok(Some((version, frame_type)))
}

/// Decodes a window frame body. Returns the count and bytes consumed.
pub fn decode_window_size(body: &[u8]) -> Result<Option<(u32, usize)>> {
    match peek_u32(body, 0) {
        None => Ok(None),
        Some(0) => Err(Error::protocol("window size of 0")),
        Some(size) => Ok(Some((size, U32_LEN))),
    }
}

pub fn decode_ack(body: &[u8]) -> Option<(u32, usize)> {
    peek_u32(body, 0).map(|seq| (seq, U32_LEN))
}

/// Decodes a v2 `J` frame body: `seq`, `len`, then `len` bytes handed to `decoder`.
pub fn decode_data_frame(
    body: &[u8],
    decoder: &dyn EventDecoder,
    max_payload_size: usize,
) -> Result<Option<(u32, Event, usize)>> {
    let (Some(seq), Some(len)) = (peek_u32(body, 0), peek_u32(body, U32_LEN)) else {
        return Ok(None);
    };
    let len = len as usize;
    check_payload_len(len, max_payload_size)?;
    let start = 2 * U32_LEN;
    let Some(payload) = body.get(start..start + len) else {
        return Ok(None);
    };
    let event = decoder.decode(payload)?;
    Ok(Some((seq, event, start + len)))
}

/// Scans the length fields of a v1 `D` frame body without copying anything.
/// Returns `seq`, the pair count and the body length once the frame is complete.
fn kv_frame_extent(body: &[u8], max_payload_size: usize) -> Result<Option<(u32, u32, usize)>> {
    let (Some(seq), Some(pairs)) = (peek_u32(body, 0), peek_u32(body, U32_LEN)) else {
        return Ok(None);
    };
    // Every pair carries at least its two length fields
    check_payload_len((pairs as usize).saturating_mul(2 * U32_LEN), max_payload_size)?;

    let mut at = 2 * U32_LEN;
    for _ in 0..u64::from(pairs) * 2 {
        let Some(len) = peek_u32(body, at) else {
            return Ok(None);
        };
        at = at.saturating_add(U32_LEN + len as usize);
        check_payload_len(at, max_payload_size)?;
        if at > body.len() {
            return Ok(None);
        }
    }
    Ok(Some((seq, pairs, at)))
}

fn take_string(body: &[u8], at: &mut usize) -> Result<String> {
    let len = peek_u32(body, *at).ok_or_else(|| Error::protocol("truncated v1 data frame"))?;
    let start = *at + U32_LEN;
    let end = start + len as usize;
    let bytes = body
        .get(start..end)
        .ok_or_else(|| Error::protocol("truncated v1 data frame"))?;
    *at = end;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Decode(DecodeError(format!("v1 data frame is not valid UTF-8: {e}"))))
}

/// Decodes a v1 `D` frame body into an object of string values.
///
/// Nothing is decoded until the whole frame has arrived.
pub fn decode_kv_frame(body: &[u8], max_payload_size: usize) -> Result<Option<(u32, Event, usize)>> {
    let Some((seq, pairs, used)) = kv_frame_extent(body, max_payload_size)? else {
        return Ok(None);
    };
    let body = &body[..used];
    let mut at = 2 * U32_LEN;
    let mut fields = serde_json::Map::new();
    for _ in 0..pairs {
        let key = take_string(body, &mut at)?;
        let value = take_string(body, &mut at)?;
        fields.insert(key, Event::String(value));
    }
    Ok(Some((seq, Event::Object(fields), used)))
}

/// Decodes a `C` frame body. The payload stays compressed until
/// [`FrameCodec::inflate`] is called on it.
pub fn decode_compressed_frame(
    body: &[u8],
    max_payload_size: usize,
) -> Result<Option<(Bytes, usize)>> {
    let Some(len) = peek_u32(body, 0) else {
        return Ok(None);
    };
    let len = len as usize;
    check_payload_len(len, max_payload_size)?;
    let Some(compressed) = body.get(U32_LEN..U32_LEN + len) else {
        return Ok(None);
    };
    Ok(Some((Bytes::copy_from_slice(compressed), U32_LEN + len)))
}

/// Inflates a zlib block, failing once it grows past `limit` bytes.
pub fn inflate_block(compressed: &[u8], limit: usize) -> Result<BytesMut> {
    let mut inflated =
        BytesMut::with_capacity(compressed.len().saturating_mul(2).min(limit)).writer();
    std::io::copy(
        &mut ZlibDecoder::new(compressed).take(limit as u64 + 1),
        &mut inflated,
    )
    .map_err(|e| Error::protocol(format!("invalid compressed frame: {e}")))?;
    let inflated = inflated.into_inner();
    check_payload_len(inflated.len(), limit)?;
    Ok(inflated)
}

pub fn encode_ack(version: Version, seq: u32) -> [u8; ACK_FRAME_LEN] {
    let seq = seq.to_be_bytes();
    [
        version.as_byte(),
        FrameType::Ack.as_byte(),
        seq[0],
        seq[1],
        seq[2],
        seq[3],
    ]
}

fn put_header(dst: &mut BytesMut, version: Version, frame_type: FrameType) {
    dst.put_u8(version.as_byte());
    dst.put_u8(frame_type.as_byte());
}

fn put_len(dst: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::protocol(format!("payload of {len} bytes does not fit a frame")))?;
    dst.put_u32(len);
    Ok(())
}

pub fn encode_window(version: Version, size: u32, dst: &mut BytesMut) {
    put_header(dst, version, FrameType::Window);
    dst.put_u32(size);
}

pub fn encode_json_frame(seq: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    put_header(dst, Version::V2, FrameType::Json);
    dst.put_u32(seq);
    put_len(dst, payload.len())?;
    dst.put_slice(payload);
    Ok(())
}

/// Encodes a v1 `D` frame. Only objects whose values are all strings are
/// representable.
pub fn encode_kv_frame(seq: u32, event: &Event, dst: &mut BytesMut) -> Result<()> {
    let Event::Object(fields) = event else {
        return Err(Error::protocol("protocol v1 can only carry object events"));
    };
    put_header(dst, Version::V1, FrameType::Data);
    dst.put_u32(seq);
    put_len(dst, fields.len())?;
    for (key, value) in fields {
        let Event::String(value) = value else {
            return Err(Error::protocol(format!(
                "protocol v1 can only carry string values, field {key:?} is {value}"
            )));
        };
        put_len(dst, key.len())?;
        dst.put_slice(key.as_bytes());
        put_len(dst, value.len())?;
        dst.put_slice(value.as_bytes());
    }
    Ok(())
}

/// Wraps already encoded frames into a zlib compressed `C` frame.
pub fn encode_compressed(
    version: Version,
    frames: &[u8],
    level: u32,
    dst: &mut BytesMut,
) -> Result<()> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(frames.len() / 2), Compression::new(level));
    encoder.write_all(frames)?;
    let compressed = encoder.finish()?;
    put_header(dst, version, FrameType::Compressed);
    put_len(dst, compressed.len())?;
    dst.put_slice(&compressed);
    Ok(())
}

/// Incremental decoder for frames received by a server.
#[derive(Clone)]
pub struct FrameCodec {
    versions: Versions,
    decoder: Arc<dyn EventDecoder>,
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(
        versions: Versions,
        decoder: Arc<dyn EventDecoder>,
        max_payload_size: usize,
    ) -> Self {
        Self {
            versions,
            decoder,
            max_payload_size,
        }
    }

    /// Inflates a compressed frame payload. `queued` is the number of
    /// inflated bytes the caller still holds; together they stay within
    /// the payload size limit.
    pub fn inflate(&self, compressed: &[u8], queued: usize) -> Result<BytesMut> {
        if queued >= self.max_payload_size {
            return Err(Error::protocol(format!(
                "{queued} inflated bytes already queued, limit is {} bytes",
                self.max_payload_size
            )));
        }
        inflate_block(compressed, self.max_payload_size - queued)
    }
}

impl Decoder for FrameCodec {
    type Item = (Version, Frame);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some((version, frame_type)) = decode_frame_header(src, self.versions)? else {
            return Ok(None);
        };
        let body = &src[HEADER_LEN..];
        let decoded = match frame_type {
            FrameType::Window => decode_window_size(body)?.map(|(n, used)| (Frame::Window(n), used)),
            FrameType::Ack => decode_ack(body).map(|(n, used)| (Frame::Ack(n), used)),
            FrameType::Json => decode_data_frame(body, self.decoder.as_ref(), self.max_payload_size)?
                .map(|(seq, event, used)| (Frame::Data { seq, event }, used)),
            FrameType::Data => decode_kv_frame(body, self.max_payload_size)?
                .map(|(seq, event, used)| (Frame::Data { seq, event }, used)),
            FrameType::Compressed => decode_compressed_frame(body, self.max_payload_size)?
                .map(|(block, used)| (Frame::Compressed(block), used)),
        };
        Ok(decoded.map(|(frame, used)| {
            src.advance(HEADER_LEN + used);
            (version, frame)
        }))
    }
}
