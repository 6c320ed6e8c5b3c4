// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the lumberjack server and client.

use std::time::Duration;

/// Errors raised while decoding, reading or writing lumberjack frames.
///
/// Everything except [`Error::Config`] is fatal to the session it occurs in:
/// the connection is closed and any partially read window is dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unexpected frame on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An event payload could not be decoded by the configured decoder.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Socket read or write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write did not complete within its deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Rejected option at construction time, before any I/O.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The delivery channel or the batch completion signal was dropped.
    #[error("closed: {0}")]
    Closed(&'static str),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether this error terminates the session it was raised in.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failure reported by an [`EventDecoder`](crate::decoder::EventDecoder).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
