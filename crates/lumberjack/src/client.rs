// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sending side of the protocol.
//!
//! A [`Client`] writes one window at a time and waits for the server's
//! cumulative ACK to cover it before sending the next one. Delivery is
//! at-least-once: after any error the connection must be dropped, redialed,
//! and the unacknowledged events sent again.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::decoder::Event;
use crate::errors::{Error, Result};
use crate::frame::{
    decode_ack, decode_frame_header, encode_compressed, encode_json_frame, encode_kv_frame,
    encode_window, FrameType, Version, Versions, ACK_FRAME_LEN, HEADER_LEN,
};
use crate::transport::{self, BoxedTransport};

pub struct Client {
    transport: BoxedTransport,
    config: ClientConfig,
    addr: String,
    // Cumulative events acknowledged on this connection
    acked: u32,
}

async fn with_deadline<T, F>(timeout: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout { op, after: timeout })?
}

impl Client {
    /// Dials `addr` (`host:port`), over TLS when configured.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Client> {
        config.validate()?;
        let transport = with_deadline(
            config.timeout,
            "connect",
            transport::connect(addr, config.tls.as_ref()),
        )
        .await?;
        debug!("Connected to lumberjack server {} using {}", addr, config.version);
        Ok(Client {
            transport,
            config,
            addr: addr.to_string(),
            acked: 0,
        })
    }

    /// Total number of events the server has acknowledged on this connection.
    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Sends `events` in windows of at most `max_window` events.
    ///
    /// Returns once every event is acknowledged. On error, how many events
    /// made it is given by the change in [`Client::acked`].
    pub async fn send(&mut self, events: &[Event]) -> Result<usize> {
        let mut sent = 0;
        for window in events.chunks(self.config.max_window) {
            self.send_window(window).await?;
            sent += window.len();
        }
        Ok(sent)
    }

    async fn send_window(&mut self, events: &[Event]) -> Result<()> {
        let count = u32::try_from(events.len())
            .map_err(|_| Error::protocol("window larger than u32::MAX events"))?;
        let wire = self.encode(events, count)?;
        trace!("Writing window of {} events ({} bytes) to {}", count, wire.len(), self.addr);

        let transport = &mut self.transport;
        with_deadline(self.config.timeout, "window write", async move {
            transport.write_all(&wire).await?;
            transport.flush().await?;
            Ok::<_, Error>(())
        })
        .await?;

        self.await_ack(count).await
    }

    fn encode(&self, events: &[Event], count: u32) -> Result<BytesMut> {
        let version = self.config.version;
        let mut data = BytesMut::new();
        for (seq, event) in (1..).zip(events) {
            match version {
                Version::V1 => encode_kv_frame(seq, event, &mut data)?,
                Version::V2 => {
                    let payload = serde_json::to_vec(event)
                        .map_err(|e| Error::protocol(format!("cannot encode event: {e}")))?;
                    encode_json_frame(seq, &payload, &mut data)?;
                }
            }
        }

        let mut wire = BytesMut::with_capacity(data.len() + 16);
        encode_window(version, count, &mut wire);
        if self.config.compression_level > 0 {
            encode_compressed(version, &data, self.config.compression_level, &mut wire)?;
        } else {
            wire.unsplit(data);
        }
        Ok(wire)
    }

    /// Reads ACK frames until one covers the window just sent.
    ///
    /// ACKs that do not move past the previous total are keepalives; each
    /// one restarts the deadline.
    async fn await_ack(&mut self, count: u32) -> Result<()> {
        let versions = match self.config.version {
            Version::V1 => Versions {
                v1: true,
                v2: false,
            },
            Version::V2 => Versions::V2_ONLY,
        };
        loop {
            let mut frame = [0u8; ACK_FRAME_LEN];
            let transport = &mut self.transport;
            with_deadline(self.config.timeout, "ack read", async {
                transport.read_exact(&mut frame).await?;
                Ok::<_, Error>(())
            })
            .await?;

            match decode_frame_header(&frame, versions)? {
                Some((_, FrameType::Ack)) => {}
                _ => {
                    return Err(Error::protocol(format!(
                        "expected ack frame, got type {:#04x}",
                        frame[1]
                    )))
                }
            }
            let Some((seq, _)) = decode_ack(&frame[HEADER_LEN..]) else {
                return Err(Error::protocol("truncated ack frame"));
            };

            let progressed = seq.wrapping_sub(self.acked);
            if progressed == count {
                self.acked = seq;
                debug!("Window of {} events acknowledged ({} total)", count, seq);
                return Ok(());
            }
            if progressed > count {
                return Err(Error::protocol(format!(
                    "ack {seq} exceeds the {} events sent",
                    self.acked.wrapping_add(count)
                )));
            }
            trace!("Keepalive ack {} from {}", seq, self.addr);
        }
    }

    pub async fn close(mut self) -> Result<()> {
        Ok(self.transport.shutdown().await?)
    }
}
