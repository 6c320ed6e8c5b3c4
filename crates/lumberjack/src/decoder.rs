// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::DecodeError;

/// A decoded event. The protocol never looks inside it.
pub type Event = serde_json::Value;

/// Turns the payload of a v2 `J` data frame into an [`Event`].
pub trait EventDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Event, DecodeError>;
}

/// Default decoder: plain `serde_json` unmarshal.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl EventDecoder for JsonDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Event, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl<F> EventDecoder for F
where
    F: Fn(&[u8]) -> Result<Event, DecodeError> + Send + Sync,
{
    fn decode(&self, payload: &[u8]) -> Result<Event, DecodeError> {
        self(payload)
    }
}
