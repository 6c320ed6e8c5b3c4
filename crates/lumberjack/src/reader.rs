// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server side ingestion: turns a byte stream into complete windows of events.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::decoder::Event;
use crate::errors::{Error, Result};
use crate::frame::{Frame, FrameCodec, Version};

// Bytes requested from the socket per read
const READ_BUFFER_SIZE: usize = 8192;

// Upper bound on the up-front allocation for a window, whatever size it announces
const MAX_PREALLOCATED_EVENTS: usize = 1024;

enum State {
    AwaitHeader,
    CollectingBatch {
        version: Version,
        remaining: u32,
        events: Vec<Event>,
    },
}

pub struct ConnectionReader<R> {
    reader: R,
    codec: FrameCodec,
    buf: BytesMut,
    // Inflated compressed blocks still being parsed, innermost last. Their
    // total size stays within the codec's payload size limit.
    blocks: Vec<BytesMut>,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    pub fn new(reader: R, codec: FrameCodec, timeout: Duration) -> Self {
        Self {
            reader,
            codec,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            blocks: Vec::new(),
            timeout,
        }
    }

    /// Reads frames until one window is complete.
    ///
    /// Returns `Ok(None)` when the peer closes the connection between windows.
    /// Any error leaves the reader unusable; the events of a partially read
    /// window are dropped with it.
    pub async fn read_batch(&mut self) -> Result<Option<(Version, Vec<Event>)>> {
        let mut state = State::AwaitHeader;
        loop {
            let in_window = matches!(state, State::CollectingBatch { .. });
            let Some((version, frame)) = self.next_frame(in_window).await? else {
                return match state {
                    State::AwaitHeader => Ok(None),
                    State::CollectingBatch { remaining, .. } => Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed with {remaining} events of the window outstanding"),
                    ))),
                };
            };

            match frame {
                Frame::Compressed(payload) => {
                    let queued = self.blocks.iter().map(BytesMut::len).sum();
                    let block = self.codec.inflate(&payload, queued)?;
                    trace!(
                        "Inflated {} byte compressed frame into {} bytes",
                        payload.len(),
                        block.len()
                    );
                    self.blocks.push(block);
                }
                Frame::Window(size) => match state {
                    State::AwaitHeader => {
                        debug!("Receiving {} window of {} events", version, size);
                        state = State::CollectingBatch {
                            version,
                            remaining: size,
                            events: Vec::with_capacity((size as usize).min(MAX_PREALLOCATED_EVENTS)),
                        };
                    }
                    State::CollectingBatch { remaining, .. } => {
                        return Err(Error::protocol(format!(
                            "window frame received with {remaining} events of the current window outstanding"
                        )));
                    }
                },
                Frame::Data { event, .. } => match &mut state {
                    State::AwaitHeader => {
                        return Err(Error::protocol("data frame received outside of a window"));
                    }
                    State::CollectingBatch {
                        version,
                        remaining,
                        events,
                    } => {
                        events.push(event);
                        *remaining -= 1;
                        if *remaining == 0 {
                            return Ok(Some((*version, std::mem::take(events))));
                        }
                    }
                },
                Frame::Ack(seq) => {
                    return Err(Error::protocol(format!(
                        "unexpected ack frame ({seq}) from sender"
                    )));
                }
            }
        }
    }

    async fn next_frame(&mut self, in_window: bool) -> Result<Option<(Version, Frame)>> {
        while let Some(block) = self.blocks.last_mut() {
            if block.is_empty() {
                self.blocks.pop();
                continue;
            }
            return match self.codec.decode(block)? {
                Some(frame) => Ok(Some(frame)),
                None => Err(Error::protocol(format!(
                    "compressed block ends inside a frame ({} trailing bytes)",
                    block.len()
                ))),
            };
        }
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            // Idle waits between windows are unbounded; anything after a
            // window or frame has started is held to the deadline.
            let bounded = in_window || !self.buf.is_empty();
            if self.read_more(bounded).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed inside a frame ({} bytes buffered)", self.buf.len()),
                )));
            }
        }
    }

    async fn read_more(&mut self, bounded: bool) -> Result<usize> {
        self.buf.reserve(READ_BUFFER_SIZE);
        if !bounded || self.timeout.is_zero() {
            return Ok(self.reader.read_buf(&mut self.buf).await?);
        }
        match tokio::time::timeout(self.timeout, self.reader.read_buf(&mut self.buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(Error::Timeout {
                op: "read",
                after: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::decoder::JsonDecoder;
    use crate::frame::{
        encode_ack, encode_compressed, encode_json_frame, encode_kv_frame, encode_window,
        Versions, DEFAULT_MAX_PAYLOAD_SIZE,
    };
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    fn reader<R: AsyncRead + Unpin>(input: R, versions: Versions) -> ConnectionReader<R> {
        let codec = FrameCodec::new(versions, Arc::new(JsonDecoder), DEFAULT_MAX_PAYLOAD_SIZE);
        ConnectionReader::new(input, codec, Duration::from_secs(5))
    }

    fn limited_reader<R: AsyncRead + Unpin>(input: R, max_payload_size: usize) -> ConnectionReader<R> {
        let codec = FrameCodec::new(Versions::V2_ONLY, Arc::new(JsonDecoder), max_payload_size);
        ConnectionReader::new(input, codec, Duration::from_secs(5))
    }

    fn compressed(frames: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_compressed(Version::V2, frames, 6, &mut buf).unwrap();
        buf
    }

    fn json_frame(seq: u32, value: &serde_json::Value) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_json_frame(seq, value.to_string().as_bytes(), &mut buf).unwrap();
        buf
    }

    fn json_window(values: &[serde_json::Value]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_window(Version::V2, values.len() as u32, &mut buf);
        for (i, v) in values.iter().enumerate() {
            encode_json_frame(i as u32 + 1, v.to_string().as_bytes(), &mut buf).unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_reads_window_in_order() {
        let events = vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})];
        let wire = json_window(&events);
        let mut reader = reader(&wire[..], Versions::V2_ONLY);

        let (version, batch) = reader.read_batch().await.unwrap().unwrap();
        assert_eq!(version, Version::V2);
        assert_eq!(batch, events);
        assert!(reader.read_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_consecutive_windows() {
        let mut wire = json_window(&[json!(1), json!(2)]);
        wire.extend_from_slice(&json_window(&[json!(3)]));
        let mut reader = reader(&wire[..], Versions::default());

        assert_eq!(reader.read_batch().await.unwrap().unwrap().1, vec![json!(1), json!(2)]);
        assert_eq!(reader.read_batch().await.unwrap().unwrap().1, vec![json!(3)]);
        assert!(reader.read_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compressed_window_matches_plain() {
        let events = vec![json!({"a": 1}), json!({"a": 2})];
        let plain = json_window(&events);

        // Window frame outside, data frames inside the compressed block
        let mut data = BytesMut::new();
        for (i, v) in events.iter().enumerate() {
            encode_json_frame(i as u32 + 1, v.to_string().as_bytes(), &mut data).unwrap();
        }
        let mut split = BytesMut::new();
        encode_window(Version::V2, 2, &mut split);
        encode_compressed(Version::V2, &data, 3, &mut split).unwrap();

        // Window and data frames all inside the compressed block
        let mut whole = BytesMut::new();
        encode_compressed(Version::V2, &plain, 9, &mut whole).unwrap();

        for wire in [plain, split, whole] {
            let mut reader = reader(&wire[..], Versions::V2_ONLY);
            assert_eq!(reader.read_batch().await.unwrap().unwrap().1, events);
        }
    }

    #[tokio::test]
    async fn test_nested_compressed_blocks() {
        let events = vec![json!("x"), json!("y")];
        let mut inner = BytesMut::new();
        encode_compressed(Version::V2, &json_window(&events), 1, &mut inner).unwrap();
        let mut outer = BytesMut::new();
        encode_compressed(Version::V2, &inner, 1, &mut outer).unwrap();

        let mut reader = reader(&outer[..], Versions::V2_ONLY);
        assert_eq!(reader.read_batch().await.unwrap().unwrap().1, events);
    }

    #[tokio::test]
    async fn test_nested_blocks_inflate_one_at_a_time() {
        // Each inner block inflates to most of the limit; together they
        // are far beyond it.
        let events: Vec<_> = (0..8).map(|i| json!(format!("{i}").repeat(3000))).collect();
        let mut outer_plain = BytesMut::new();
        encode_window(Version::V2, events.len() as u32, &mut outer_plain);
        for (i, event) in events.iter().enumerate() {
            outer_plain.extend_from_slice(&compressed(&json_frame(i as u32 + 1, event)));
        }
        let wire = compressed(&outer_plain);

        let mut reader = limited_reader(&wire[..], 4096);
        assert_eq!(reader.read_batch().await.unwrap().unwrap().1, events);
    }

    #[tokio::test]
    async fn test_queued_inflated_bytes_share_one_limit() {
        let big = json!("b".repeat(3000));
        let small = json!("s".repeat(2000));

        // The outer block's remaining data frame is still queued when the
        // nested block inflates.
        let mut over = BytesMut::new();
        encode_window(Version::V2, 2, &mut over);
        over.extend_from_slice(&compressed(&json_frame(1, &big)));
        over.extend_from_slice(&json_frame(2, &small));
        let wire = compressed(&over);
        let err = limited_reader(&wire[..], 4096).read_batch().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "unexpected {err:?}");

        // Same frames with the data frame consumed first fit.
        let mut under = BytesMut::new();
        encode_window(Version::V2, 2, &mut under);
        under.extend_from_slice(&json_frame(1, &small));
        under.extend_from_slice(&compressed(&json_frame(2, &big)));
        let wire = compressed(&under);
        let (_, events) = limited_reader(&wire[..], 4096).read_batch().await.unwrap().unwrap();
        assert_eq!(events, vec![small, big]);
    }

    #[tokio::test]
    async fn test_v1_window() {
        let mut wire = BytesMut::new();
        encode_window(Version::V1, 1, &mut wire);
        encode_kv_frame(1, &json!({"message": "hi"}), &mut wire).unwrap();
        let mut reader = reader(&wire[..], Versions::default());

        let (version, events) = reader.read_batch().await.unwrap().unwrap();
        assert_eq!(version, Version::V1);
        assert_eq!(events, vec![json!({"message": "hi"})]);
    }

    #[tokio::test]
    async fn test_truncated_window_is_io_error() {
        let mut wire = BytesMut::new();
        encode_window(Version::V2, 2, &mut wire);
        encode_json_frame(1, br#"{"a":1}"#, &mut wire).unwrap();
        let mut reader = reader(&wire[..], Versions::default());

        let err = reader.read_batch().await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_io_error() {
        let wire = json_window(&[json!({"a": 1})]);
        let mut reader = reader(&wire[..wire.len() - 2], Versions::default());
        assert!(matches!(reader.read_batch().await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_protocol_violations() {
        let mut zero = BytesMut::new();
        encode_window(Version::V2, 0, &mut zero);

        let mut orphan = BytesMut::new();
        encode_json_frame(1, b"{}", &mut orphan).unwrap();

        let mut double = BytesMut::new();
        encode_window(Version::V2, 2, &mut double);
        encode_window(Version::V2, 2, &mut double);

        let mut ack = BytesMut::from(&encode_ack(Version::V2, 1)[..]);
        ack.extend_from_slice(&json_window(&[json!(1)]));

        let mut partial = json_frame(1, &json!({"a": 1}));
        partial.truncate(partial.len() - 1);
        let mut truncated_block = BytesMut::new();
        encode_window(Version::V2, 1, &mut truncated_block);
        truncated_block.extend_from_slice(&compressed(&partial));

        let v1_only = Versions {
            v1: true,
            v2: false,
        };
        let disabled = json_window(&[json!(1)]);

        for (wire, versions) in [
            (zero, Versions::default()),
            (orphan, Versions::default()),
            (double, Versions::default()),
            (ack, Versions::default()),
            (truncated_block, Versions::default()),
            (disabled, v1_only),
        ] {
            let mut reader = reader(&wire[..], versions);
            let err = reader.read_batch().await.unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "unexpected {err:?}");
        }
    }

    #[tokio::test]
    async fn test_handles_byte_at_a_time_delivery() {
        let events = vec![json!({"a": 1}), json!({"b": [1, 2, 3]})];
        let wire = json_window(&events);
        let (mut tx, rx) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            for byte in wire.iter() {
                tx.write_all(&[*byte]).await.unwrap();
            }
        });

        let mut reader = reader(rx, Versions::default());
        assert_eq!(reader.read_batch().await.unwrap().unwrap().1, events);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_window_times_out() {
        let mut wire = BytesMut::new();
        encode_window(Version::V2, 2, &mut wire);
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&wire).await.unwrap();

        let mut reader = reader(rx, Versions::default());
        let err = reader.read_batch().await.unwrap_err();
        assert!(err.is_timeout());
        drop(tx);
    }
}
