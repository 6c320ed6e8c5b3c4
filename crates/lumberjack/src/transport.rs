// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte streams a session can run over: plain TCP or TLS-wrapped TCP.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ClientTls;
use crate::errors::{Error, Result};

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Completes the server side of a connection, running the TLS handshake when configured.
pub(crate) async fn accept(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<&tokio_rustls::TlsAcceptor>,
) -> Result<BoxedTransport> {
    let _ = stream.set_nodelay(true);
    match tls {
        None => Ok(Box::new(stream)),
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| Error::Tls(format!("handshake with {peer} failed: {e}")))?;
            debug!("TLS handshake with {} completed", peer);
            Ok(Box::new(stream))
        }
    }
}

/// Dials `addr`, wrapping the stream in TLS when configured.
pub(crate) async fn connect(addr: &str, tls: Option<&ClientTls>) -> Result<BoxedTransport> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    match tls {
        None => Ok(Box::new(stream)),
        Some(tls) => {
            let stream = tls
                .connector
                .connect(tls.server_name.clone(), stream)
                .await
                .map_err(|e| Error::Tls(format!("handshake with {addr} failed: {e}")))?;
            Ok(Box::new(stream))
        }
    }
}
