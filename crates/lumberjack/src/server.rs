// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lumberjack server: accepts connections and funnels their batches into one channel.
//!
//! Every accepted connection gets a session made of two tasks sharing the
//! socket. The reader decodes windows and pushes each completed [`Batch`]
//! onto the delivery channel shared by all sessions, blocking while that
//! channel is full. The writer owns the write half: it waits for the
//! consumer to acknowledge the pending batch, writes the cumulative ACK,
//! and sends keepalive ACKs on a timer. A session holds at most one
//! unacknowledged window at a time.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::batch::Batch;
use crate::config::ServerConfig;
use crate::errors::{Error, Result};
use crate::frame::{FrameCodec, Version};
use crate::reader::ConnectionReader;
use crate::transport::{self, BoxedTransport};
use crate::writer::ConnectionWriter;

/// A running lumberjack listener.
pub struct Server {
    local_addr: SocketAddr,
    batches: mpsc::Receiver<Batch>,
    cancel_token: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    active_sessions: Arc<AtomicUsize>,
}

impl Server {
    /// Binds `addr` and starts accepting connections.
    pub async fn listen(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Server> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        Self::with_listener(listener, config)
    }

    /// Starts accepting connections on an already bound listener.
    pub fn with_listener(listener: TcpListener, config: ServerConfig) -> Result<Server> {
        config.validate()?;
        let local_addr = listener.local_addr()?;
        let (delivery, batches) = mpsc::channel(config.channel_capacity);
        let cancel_token = CancellationToken::new();
        let active_sessions = Arc::new(AtomicUsize::new(0));

        let acceptor = Acceptor {
            listener,
            config: Arc::new(config),
            delivery,
            cancel_token: cancel_token.clone(),
            active_sessions: Arc::clone(&active_sessions),
        };
        let accept_task = tokio::spawn(acceptor.spin());
        info!("Lumberjack server listening on {}", local_addr);

        Ok(Server {
            local_addr,
            batches,
            cancel_token,
            accept_task: Some(accept_task),
            active_sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next batch from any session.
    ///
    /// Returns `None` once the server is closed and the channel is drained.
    pub async fn receive(&mut self) -> Option<Batch> {
        self.batches.recv().await
    }

    /// The delivery channel shared by every session.
    pub fn receiver(&mut self) -> &mut mpsc::Receiver<Batch> {
        &mut self.batches
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Stops accepting, terminates every session and waits for them to exit.
    ///
    /// Batches already in the delivery channel can still be received, but
    /// acknowledging them no longer reaches the sender.
    pub async fn close(&mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("Lumberjack accept loop failed: {}", e);
            }
        }
        info!("Lumberjack server on {} closed", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct Acceptor {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    delivery: mpsc::Sender<Batch>,
    cancel_token: CancellationToken,
    active_sessions: Arc<AtomicUsize>,
}

impl Acceptor {
    async fn spin(self) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = Session {
                            peer,
                            config: Arc::clone(&self.config),
                            delivery: self.delivery.clone(),
                            cancel_token: self.cancel_token.child_token(),
                            _active: ActiveSession::new(&self.active_sessions),
                        };
                        let span = tracing::info_span!("session", peer = %peer);
                        sessions.spawn(session.run(stream).instrument(span));
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        debug!("Connection dropped before accept completed: {}", e);
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        // Typically descriptor exhaustion; give sessions a chance to finish
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        drop(self.listener);
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Session task failed: {}", e);
            }
        }
        debug!("Lumberjack accept loop stopped");
    }
}

/// Keeps the live session count accurate however the session ends.
struct ActiveSession(Arc<AtomicUsize>);

impl ActiveSession {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Completion of a delivered batch, handed from the reader to the writer.
struct PendingAck {
    version: Version,
    count: u32,
    done: oneshot::Receiver<()>,
    // Released once the ACK is written, letting the reader start the next window
    _window: OwnedSemaphorePermit,
}

struct Session {
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    delivery: mpsc::Sender<Batch>,
    cancel_token: CancellationToken,
    _active: ActiveSession,
}

impl Session {
    async fn run(self, stream: TcpStream) {
        info!("Session started");
        let transport = match self.handshake(stream).await {
            Ok(Some(transport)) => transport,
            Ok(None) => {
                debug!("Session with {} cancelled during handshake", self.peer);
                return;
            }
            Err(e) => {
                error!("Failed to establish session with {}: {}", self.peer, e);
                return;
            }
        };

        let (read_half, write_half) = tokio::io::split(transport);
        let reader = ConnectionReader::new(
            read_half,
            FrameCodec::new(
                self.config.versions,
                Arc::clone(&self.config.decoder),
                self.config.max_payload_size,
            ),
            self.config.timeout,
        );
        let writer = ConnectionWriter::new(write_half, self.config.timeout);
        let (ack_tx, ack_rx) = mpsc::channel(1);

        let writer_task = tokio::spawn(
            write_loop(
                writer,
                ack_rx,
                self.config.keepalive,
                self.cancel_token.clone(),
            )
            .in_current_span(),
        );

        if let Err(e) = self.read_loop(reader, ack_tx).await {
            log_session_error(self.peer, &e);
            self.cancel_token.cancel();
        }

        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_session_error(self.peer, &e),
            Err(e) => error!("Writer task for {} failed: {}", self.peer, e),
        }
        self.cancel_token.cancel();
        info!("Session closed");
    }

    /// Returns `None` when the session is cancelled before the handshake completes.
    async fn handshake(&self, stream: TcpStream) -> Result<Option<BoxedTransport>> {
        let accept = transport::accept(stream, self.peer, self.config.tls.as_ref());
        let timeout = self.config.timeout;
        let bounded = async {
            if timeout.is_zero() {
                return accept.await;
            }
            match tokio::time::timeout(timeout, accept).await {
                Ok(accepted) => accepted,
                Err(_) => Err(Error::Timeout {
                    op: "handshake",
                    after: timeout,
                }),
            }
        };
        tokio::select! {
            _ = self.cancel_token.cancelled() => Ok(None),
            transport = bounded => transport.map(Some),
        }
    }

    async fn read_loop(
        &self,
        mut reader: ConnectionReader<ReadHalf<BoxedTransport>>,
        ack_tx: mpsc::Sender<PendingAck>,
    ) -> Result<()> {
        let window = Arc::new(Semaphore::new(1));
        loop {
            let permit = tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(()),
                permit = Arc::clone(&window).acquire_owned() => {
                    permit.map_err(|_| Error::Closed("session window"))?
                }
            };

            let read = tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(()),
                read = reader.read_batch() => read?,
            };
            let Some((version, events)) = read else {
                debug!("Connection closed by {}", self.peer);
                return Ok(());
            };

            let count = u32::try_from(events.len())
                .map_err(|_| Error::protocol("window larger than u32::MAX events"))?;
            let (batch, done) = Batch::new(version, events);
            debug!("Delivering batch of {} events", count);

            // Register the completion before delivering, so keepalives keep
            // flowing while the delivery channel is full.
            ack_tx
                .send(PendingAck {
                    version,
                    count,
                    done,
                    _window: permit,
                })
                .await
                .map_err(|_| Error::Closed("ack writer"))?;

            tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(()),
                sent = self.delivery.send(batch) => {
                    sent.map_err(|_| Error::Closed("delivery channel"))?;
                }
            }
        }
    }
}

async fn write_loop(
    writer: ConnectionWriter<WriteHalf<BoxedTransport>>,
    pending_rx: mpsc::Receiver<PendingAck>,
    keepalive: Duration,
    cancel_token: CancellationToken,
) -> Result<()> {
    let result = run_writer(writer, pending_rx, keepalive, &cancel_token).await;
    if result.is_err() {
        cancel_token.cancel();
    }
    result
}

async fn run_writer(
    mut writer: ConnectionWriter<WriteHalf<BoxedTransport>>,
    mut pending_rx: mpsc::Receiver<PendingAck>,
    keepalive: Duration,
    cancel_token: &CancellationToken,
) -> Result<()> {
    let mut ticker = keepalive_ticker(keepalive);
    let mut pending: Option<PendingAck> = None;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return Ok(()),
            completed = completion(&mut pending) => {
                let Some(acked) = pending.take() else { continue };
                if completed.is_err() {
                    warn!("Batch of {} events dropped without acknowledgement; closing session", acked.count);
                    return Err(Error::Closed("batch completion signal"));
                }
                let total = writer.ack(acked.version, acked.count).await?;
                debug!("Acknowledged {} events ({} total)", acked.count, total);
            }
            next = pending_rx.recv(), if pending.is_none() => match next {
                Some(next) => pending = Some(next),
                None => break,
            },
            _ = tick(&mut ticker) => {
                writer.keepalive(pending.as_ref().map(|p| p.version)).await?;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down write half: {}", e);
    }
    Ok(())
}

fn keepalive_ticker(keepalive: Duration) -> Option<Interval> {
    if keepalive.is_zero() {
        return None;
    }
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn completion(
    pending: &mut Option<PendingAck>,
) -> std::result::Result<(), oneshot::error::RecvError> {
    match pending {
        Some(pending) => (&mut pending.done).await,
        None => std::future::pending().await,
    }
}

fn log_session_error(peer: SocketAddr, e: &Error) {
    match e {
        Error::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            warn!("Session with {} ended early: {}", peer, e)
        }
        _ => error!("Session with {} failed: {}", peer, e),
    }
}
