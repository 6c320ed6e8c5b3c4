// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writes cumulative ACK and keepalive frames back to the sender.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::errors::{Error, Result};
use crate::frame::{encode_ack, Version};

/// Sole owner of a connection's write half.
///
/// The counter is cumulative over the life of the connection and wraps at
/// `u32::MAX`, the same way the sender's counter does.
pub struct ConnectionWriter<W> {
    writer: W,
    timeout: Duration,
    acked: u32,
    version: Option<Version>,
}

impl<W: AsyncWrite + Unpin> ConnectionWriter<W> {
    pub fn new(writer: W, timeout: Duration) -> Self {
        Self {
            writer,
            timeout,
            acked: 0,
            version: None,
        }
    }

    /// Total number of events acknowledged so far.
    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Acknowledges `count` more events and writes the new cumulative total.
    pub async fn ack(&mut self, version: Version, count: u32) -> Result<u32> {
        self.acked = self.acked.wrapping_add(count);
        self.version = Some(version);
        self.write_ack("ack write", version, self.acked).await?;
        Ok(self.acked)
    }

    /// Repeats the last cumulative total so an idle sender does not time out.
    ///
    /// Nothing is written before the first window, since the peer's protocol
    /// version is not known yet.
    pub async fn keepalive(&mut self, pending: Option<Version>) -> Result<()> {
        let Some(version) = pending.or(self.version) else {
            return Ok(());
        };
        self.write_ack("keepalive write", version, self.acked).await
    }

    async fn write_ack(&mut self, op: &'static str, version: Version, seq: u32) -> Result<()> {
        let frame = encode_ack(version, seq);
        trace!("Writing {} ack {}", version, seq);
        let timeout = self.timeout;
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if timeout.is_zero() {
            return Ok(write.await?);
        }
        match tokio::time::timeout(timeout, write).await {
            Ok(written) => Ok(written?),
            Err(_) => Err(Error::Timeout { op, after: timeout }),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        Ok(self.writer.shutdown().await?)
    }
}
