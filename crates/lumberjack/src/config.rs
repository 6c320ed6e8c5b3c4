// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::decoder::{EventDecoder, JsonDecoder};
use crate::errors::{Error, Result};
use crate::frame::{Version, Versions, DEFAULT_MAX_PAYLOAD_SIZE};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(3);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;
pub const DEFAULT_MAX_WINDOW: usize = 2048;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 3;

/// Configuration for a lumberjack [`Server`](crate::server::Server)
#[derive(Clone)]
pub struct ServerConfig {
    /// Deadline for ACK writes and for reads inside a window. Zero disables it.
    pub timeout: Duration,
    /// Interval between keepalive ACKs. Zero disables keepalives.
    pub keepalive: Duration,
    /// Protocol versions accepted on the wire
    pub versions: Versions,
    /// Decoder applied to v2 JSON data frames
    pub decoder: Arc<dyn EventDecoder>,
    /// Wraps accepted connections in TLS when set
    pub tls: Option<TlsAcceptor>,
    /// Capacity of the delivery channel shared by all sessions
    pub channel_capacity: usize,
    /// Largest payload or inflated block accepted in a single frame
    pub max_payload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            versions: Versions::default(),
            decoder: Arc::new(JsonDecoder),
            tls: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("timeout", &self.timeout)
            .field("keepalive", &self.keepalive)
            .field("versions", &self.versions)
            .field("tls", &self.tls.is_some())
            .field("channel_capacity", &self.channel_capacity)
            .field("max_payload_size", &self.max_payload_size)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.versions.is_empty() {
            return Err(Error::Config(
                "at least one protocol version must be enabled".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config(
                "delivery channel capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(Error::Config(
                "max payload size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS settings of a [`Client`](crate::client::Client).
#[derive(Clone)]
pub struct ClientTls {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

/// Configuration for a lumberjack [`Client`](crate::client::Client)
#[derive(Clone)]
pub struct ClientConfig {
    pub version: Version,
    /// Deadline for writes and for each wait on an ACK. Zero disables it.
    pub timeout: Duration,
    /// zlib level 0-9. Zero sends uncompressed frames.
    pub compression_level: u32,
    /// Maximum number of unacknowledged events on the wire.
    pub max_window: usize,
    pub tls: Option<ClientTls>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: Version::V2,
            timeout: DEFAULT_TIMEOUT,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_window: DEFAULT_MAX_WINDOW,
            tls: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("compression_level", &self.compression_level)
            .field("max_window", &self.max_window)
            .field("tls", &self.tls.as_ref().map(|t| &t.server_name))
            .finish()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_window == 0 {
            return Err(Error::Config(
                "max window must be greater than 0".to_string(),
            ));
        }
        if u32::try_from(self.max_window).is_err() {
            return Err(Error::Config(format!(
                "max window {} does not fit a window frame",
                self.max_window
            )));
        }
        if self.compression_level > 9 {
            return Err(Error::Config(format!(
                "compression level {} is outside 0-9",
                self.compression_level
            )));
        }
        Ok(())
    }
}
