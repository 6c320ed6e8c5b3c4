// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads JSON events from stdin, one per line, and ships them to a lumberjack server.
//! Lines that are not valid JSON are sent as `{"message": "<line>"}`. Over
//! protocol v1, which only carries strings, other values are sent as their
//! JSON text.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use anyhow::Context;
use lumberjack::{Client, Event, Version};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use lumberjack_server::{config::SenderSettings, logger};

fn to_event(line: &str, version: Version) -> Event {
    let event = serde_json::from_str(line).unwrap_or_else(|_| json!({ "message": line }));
    match (version, event) {
        (Version::V1, Event::Object(fields)) => Event::Object(
            fields
                .into_iter()
                .map(|(key, value)| match value {
                    Event::String(_) => (key, value),
                    other => (key, Event::String(other.to_string())),
                })
                .collect(),
        ),
        (_, event) => event,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LUMBERJACK_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    logger::init(&log_level)?;

    let settings = SenderSettings::from_env()?;
    let config = settings.client_config()?;
    let mut client = Client::connect(&settings.addr, config)
        .await
        .with_context(|| format!("failed to connect to {}", settings.addr))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::with_capacity(settings.window);
    let mut total = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        pending.push(to_event(&line, settings.version));
        if pending.len() == settings.window {
            total += client.send(&pending).await.context("failed to send window")?;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        total += client.send(&pending).await.context("failed to send window")?;
    }

    client.close().await.context("failed to close connection")?;
    info!("Sent {} events to {}", total, settings.addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_are_wrapped() {
        assert_eq!(to_event(r#"{"a":1}"#, Version::V2), json!({"a": 1}));
        assert_eq!(
            to_event("plain text", Version::V2),
            json!({"message": "plain text"})
        );
    }

    #[test]
    fn test_v1_values_become_strings() {
        assert_eq!(
            to_event(r#"{"a":1,"b":"x","c":[true]}"#, Version::V1),
            json!({"a": "1", "b": "x", "c": "[true]"})
        );
    }
}
