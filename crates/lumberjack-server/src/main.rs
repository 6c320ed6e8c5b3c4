// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use lumberjack::{RateLimiter, Server};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lumberjack_server::{
    config::ServerSettings,
    error::ServerError,
    logger,
    serve::serve,
    sink::{BatchSink, DiscardSink, SinkKind, StdoutSink},
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let settings = match ServerSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("LUMBERJACK | ERROR | {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logger::init(&settings.log_level) {
        eprintln!("LUMBERJACK | ERROR | {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: ServerSettings) -> Result<(), ServerError> {
    let config = settings.server_config()?;
    let mut server = Server::listen(settings.listen_addr(), config).await?;

    let sink: Arc<dyn BatchSink> = match settings.sink {
        SinkKind::Stdout => Arc::new(StdoutSink::new()),
        SinkKind::Discard => Arc::new(DiscardSink::default()),
    };
    let limiter = RateLimiter::new(settings.rate);
    if !limiter.is_unlimited() {
        info!("Publishing at most {} events per second", limiter.events_per_sec());
    }

    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, shutting down"),
                Err(e) => error!("Failed to listen for interrupt: {}", e),
            }
            cancel_token.cancel();
        }
    });

    serve(&mut server, sink.as_ref(), &limiter, cancel_token).await;
    server.close().await;
    Ok(())
}
