// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use lumberjack::{RateLimiter, Server};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::sink::BatchSink;

/// Moves batches from the server into `sink` until cancelled or the server closes.
///
/// A batch is acknowledged only once the sink has published it. A failed
/// publish drops the batch unacknowledged, which closes that sender's
/// session so it redelivers the window on a new connection.
///
/// Returns the number of events published.
pub async fn serve(
    server: &mut Server,
    sink: &dyn BatchSink,
    limiter: &RateLimiter,
    cancel_token: CancellationToken,
) -> u64 {
    let mut published = 0u64;
    loop {
        let batch = tokio::select! {
            _ = cancel_token.cancelled() => break,
            batch = server.receive() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let count = batch.len() as u64;
        limiter.acquire(count).await;
        match sink.publish(batch.events()).await {
            Ok(()) => {
                batch.ack();
                published += count;
                debug!("Published batch of {} events", count);
            }
            Err(e) => {
                error!(
                    "Failed to publish batch of {} events, leaving it unacknowledged: {}",
                    count, e
                );
            }
        }
    }
    info!("Stopped serving after {} events", published);
    published
}
