// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for received batches.
//!
//! A batch is acknowledged to its sender only after [`BatchSink::publish`]
//! returns `Ok`, so a sink must not return before the events are written.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lumberjack::Event;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write events: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn publish(&self, events: &[Event]) -> Result<(), SinkError>;
}

/// Writes each event as one JSON line.
pub struct StdoutSink<W = Stdout> {
    out: Mutex<W>,
}

impl StdoutSink<Stdout> {
    pub fn new() -> Self {
        Self::with_writer(tokio::io::stdout())
    }
}

impl Default for StdoutSink<Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> StdoutSink<W> {
    pub fn with_writer(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> BatchSink for StdoutSink<W> {
    async fn publish(&self, events: &[Event]) -> Result<(), SinkError> {
        let mut lines = Vec::with_capacity(events.len() * 128);
        for event in events {
            serde_json::to_writer(&mut lines, event)?;
            lines.push(b'\n');
        }
        let mut out = self.out.lock().await;
        out.write_all(&lines).await?;
        out.flush().await?;
        Ok(())
    }
}

/// Drops every event, keeping only a count. Useful for load testing senders.
#[derive(Debug, Default)]
pub struct DiscardSink {
    published: AtomicU64,
}

impl DiscardSink {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BatchSink for DiscardSink {
    async fn publish(&self, events: &[Event]) -> Result<(), SinkError> {
        self.published
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Stdout,
    Discard,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdout" => Ok(SinkKind::Stdout),
            "discard" => Ok(SinkKind::Discard),
            other => Err(format!(
                "Invalid sink '{other}'. Must be one of: stdout, discard"
            )),
        }
    }
}
