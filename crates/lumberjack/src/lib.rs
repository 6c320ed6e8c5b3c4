// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Lumberjack
//!
//! Server and client for the lumberjack v1/v2 batch protocol.
//!
//! A sender announces a window of N events, streams N data frames (optionally
//! zlib-compressed), then waits for a cumulative ACK. The [`Server`] turns each
//! complete window into a [`Batch`] and writes the ACK only once the consumer
//! calls [`Batch::ack`]. Until then the session sends keepalive ACKs carrying
//! the previous total so the sender does not time out.
//!
//! ## Modules
//!
//! - [`frame`]: wire format and the [`frame::FrameCodec`] decoder
//! - [`reader`] / [`writer`]: per-connection ingestion and ACK emission
//! - [`server`]: listener, session table and batch delivery
//! - [`client`]: windowed sender that waits for acknowledgements
//! - [`ratelimit`]: token bucket for pacing consumers

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod client;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod frame;
pub mod ratelimit;
pub mod reader;
pub mod server;
pub mod transport;
pub mod writer;

pub use batch::{Batch, BatchAck};
pub use client::Client;
pub use config::{ClientConfig, ClientTls, ServerConfig};
pub use decoder::{Event, EventDecoder, JsonDecoder};
pub use errors::{DecodeError, Error, Result};
pub use frame::{Version, Versions};
pub use ratelimit::RateLimiter;
pub use server::Server;
