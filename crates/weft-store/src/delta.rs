// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use weft_protocol::{Message, Part, Session};

use crate::requests::{PermissionRecord, QuestionRecord};

/// One incremental store change, delivered to the [`StoreView`] in
/// admission-ordered batches.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreDelta {
    SessionUpserted(Session),
    SessionRemoved { id: String },
    MessageUpserted(Message),
    MessageRemoved { id: String, session_id: String },
    PartUpserted(Part),
    PartRemoved { id: String, message_id: String },
    PermissionChanged(PermissionRecord),
    QuestionChanged(QuestionRecord),
}

/// Client-side state of the synchronous chat request for the active turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingStatus {
    Idle,
    /// Request sent, response head not yet received.
    Connecting,
    /// Response head received, body events flowing.
    Streaming,
    Done,
    Error,
}

impl StreamingStatus {
    /// A turn is in flight; further `send_message` calls are refused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }
}

/// Observer notified after each applied batch. Implementations receive the
/// whole batch as one call so a reactive UI can re-render once per batch
/// rather than once per delta.
pub trait StoreView: Send {
    fn on_batch(&mut self, deltas: &[StoreDelta]);

    /// Streaming-state transitions of the active chat turn.
    fn streaming_changed(&mut self, _status: StreamingStatus) {}
}

/// No-op observer for callers that only want the stores.
#[derive(Debug, Default)]
pub struct NullView;

impl StoreView for NullView {
    fn on_batch(&mut self, _deltas: &[StoreDelta]) {}
}

/// Test observer that records every batch and status transition verbatim.
#[derive(Debug, Default)]
pub struct RecordingView {
    pub batches: Vec<Vec<StoreDelta>>,
    pub statuses: Vec<StreamingStatus>,
}

impl RecordingView {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded deltas flattened in arrival order.
    pub fn deltas(&self) -> Vec<&StoreDelta> {
        self.batches.iter().flatten().collect()
    }

    pub fn upserted_message_ids(&self) -> Vec<&str> {
        self.deltas()
            .into_iter()
            .filter_map(|d| match d {
                StoreDelta::MessageUpserted(m) => Some(m.id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn upserted_part_ids(&self) -> Vec<&str> {
        self.deltas()
            .into_iter()
            .filter_map(|d| match d {
                StoreDelta::PartUpserted(p) => Some(p.id.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl StoreView for RecordingView {
    fn on_batch(&mut self, deltas: &[StoreDelta]) {
        self.batches.push(deltas.to_vec());
    }

    fn streaming_changed(&mut self, status: StreamingStatus) {
        self.statuses.push(status);
    }
}
