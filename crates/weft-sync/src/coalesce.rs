// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use weft_protocol::ServerEvent;

pub struct CoalescerConfig {
    /// How long after the first queued event the batch is closed. A zero
    /// window makes the pipeline drain synchronously on every admit.
    pub window: Duration,
    /// Queue cap; overflow drops the newest event.
    pub max_queue: usize,
    /// Invoked with the event being dropped on overflow.
    pub on_queue_full: Option<Box<dyn FnMut(&ServerEvent) + Send>>,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(25), max_queue: 1000, on_queue_full: None }
    }
}

impl std::fmt::Debug for CoalescerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescerConfig")
            .field("window", &self.window)
            .field("max_queue", &self.max_queue)
            .field("on_queue_full", &self.on_queue_full.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerMetrics {
    pub total_events_processed: u64,
    pub total_batches: u64,
    pub total_dropped: u64,
    pub current_queue_size: usize,
}

/// Time-windowed micro-batcher between the ordering stage and the router.
///
/// Admission order is preserved inside a batch, and the downstream observer
/// is notified once per batch rather than once per event.
#[derive(Debug)]
pub struct Coalescer {
    config: CoalescerConfig,
    queue: Vec<ServerEvent>,
    window_deadline: Option<Instant>,
    total_events: u64,
    total_batches: u64,
    total_dropped: u64,
}

impl Coalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            config,
            queue: Vec::new(),
            window_deadline: None,
            total_events: 0,
            total_batches: 0,
            total_dropped: 0,
        }
    }

    /// Enqueue one event; the first event of a window arms the deadline.
    /// Returns `false` when the queue is full and the event was dropped.
    pub fn add(&mut self, event: ServerEvent, now: Instant) -> bool {
        if self.queue.len() >= self.config.max_queue {
            self.total_dropped += 1;
            warn!(event_id = %event.event_id, "coalescer queue full, dropping newest event");
            if let Some(cb) = self.config.on_queue_full.as_mut() {
                cb(&event);
            }
            return false;
        }
        if self.queue.is_empty() {
            self.window_deadline = Some(now + self.config.window);
        }
        self.queue.push(event);
        self.total_events += 1;
        true
    }

    /// When the current batch window closes, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.window_deadline
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Close the window and hand the batch to the caller for routing.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        self.window_deadline = None;
        if self.queue.is_empty() {
            return Vec::new();
        }
        self.total_batches += 1;
        std::mem::take(&mut self.queue)
    }

    /// Discard the queue without counting a batch: shutdown path, events
    /// are intentionally dropped on the floor.
    pub fn flush(&mut self) -> Vec<ServerEvent> {
        self.window_deadline = None;
        std::mem::take(&mut self.queue)
    }

    pub fn metrics(&self) -> CoalescerMetrics {
        CoalescerMetrics {
            total_events_processed: self.total_events,
            total_batches: self.total_batches,
            total_dropped: self.total_dropped,
            current_queue_size: self.queue.len(),
        }
    }
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new(CoalescerConfig::default())
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(id: &str) -> ServerEvent {
        ServerEvent {
            kind: "server.heartbeat".into(),
            properties: json!({}),
            event_id: id.into(),
            sequence: 0,
            timestamp: 0,
            directory: None,
            session_id: None,
        }
    }

    #[test]
    fn first_event_arms_the_window() {
        let mut c = Coalescer::default();
        let now = Instant::now();
        assert!(c.deadline().is_none());
        c.add(event("e1"), now);
        assert_eq!(c.deadline(), Some(now + Duration::from_millis(25)));
        c.add(event("e2"), now + Duration::from_millis(5));
        // Second event does not re-arm.
        assert_eq!(c.deadline(), Some(now + Duration::from_millis(25)));
    }

    #[test]
    fn drain_preserves_admission_order_and_counts_a_batch() {
        let mut c = Coalescer::default();
        let now = Instant::now();
        for id in ["e1", "e2", "e3"] {
            c.add(event(id), now);
        }
        let batch = c.drain();
        let ids: Vec<_> = batch.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["e1", "e2", "e3"]);
        assert!(c.deadline().is_none());
        assert_eq!(c.metrics().total_batches, 1);
    }

    #[test]
    fn flush_does_not_count_a_batch() {
        let mut c = Coalescer::default();
        c.add(event("e1"), Instant::now());
        let dropped = c.flush();
        assert_eq!(dropped.len(), 1);
        assert_eq!(c.metrics().total_batches, 0);
        assert_eq!(c.metrics().current_queue_size, 0);
    }

    #[test]
    fn overflow_drops_newest_and_fires_callback() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&dropped);
        let mut c = Coalescer::new(CoalescerConfig {
            window: Duration::from_millis(25),
            max_queue: 2,
            on_queue_full: Some(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        });
        let now = Instant::now();
        assert!(c.add(event("e1"), now));
        assert!(c.add(event("e2"), now));
        assert!(!c.add(event("e3"), now));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(c.metrics().total_dropped, 1);
        // The queued pair survives untouched.
        assert_eq!(c.drain().len(), 2);
    }

    #[test]
    fn empty_drain_is_a_noop() {
        let mut c = Coalescer::default();
        assert!(c.drain().is_empty());
        assert_eq!(c.metrics().total_batches, 0);
    }
}
