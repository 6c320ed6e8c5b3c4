// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::oneshot;

use crate::decoder::Event;
use crate::frame::Version;

/// A fully decoded window of events.
///
/// The session that produced it sends the cumulative ACK only once
/// [`Batch::ack`] (or [`BatchAck::ack`]) has been called. Dropping a batch
/// without acknowledging it terminates the session so the sender redelivers.
#[derive(Debug)]
pub struct Batch {
    version: Version,
    events: Vec<Event>,
    ack: BatchAck,
}

/// One-shot completion signal of a [`Batch`].
#[derive(Debug)]
pub struct BatchAck {
    tx: oneshot::Sender<()>,
}

impl BatchAck {
    pub fn ack(self) {
        // The session may already be gone; the sender will redeliver.
        let _ = self.tx.send(());
    }
}

impl Batch {
    pub(crate) fn new(version: Version, events: Vec<Event>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let batch = Self {
            version,
            events,
            ack: BatchAck { tx },
        };
        (batch, rx)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Signals that every event of the batch has been durably handled.
    pub fn ack(self) {
        self.ack.ack();
    }

    /// Takes ownership of the events, keeping the completion signal for later.
    pub fn into_parts(self) -> (Vec<Event>, BatchAck) {
        (self.events, self.ack)
    }
}
