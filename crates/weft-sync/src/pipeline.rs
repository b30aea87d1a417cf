// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::time::Instant;
use tracing::{debug, warn};
use weft_protocol::{now_ms, validate, Message, Part, ServerEvent};
use weft_store::{StoreError, StoreView, Stores};

use crate::coalesce::{Coalescer, CoalescerConfig, CoalescerMetrics};
use crate::dedup::{DedupStats, Deduplicator, DEFAULT_DEDUP_CAPACITY};
use crate::ordering::{OrderingBuffer, OrderingConfig, OrderingStats, SessionOrderingStats};
use crate::router::{EventRouter, RouterConfig, RouterDiagnostics};

#[derive(Debug)]
pub struct PipelineConfig {
    pub dedup_capacity: usize,
    pub ordering: OrderingConfig,
    pub coalescer: CoalescerConfig,
    pub router: RouterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            ordering: OrderingConfig::default(),
            coalescer: CoalescerConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration with a zero-length coalescer window, so every admitted
    /// event is routed synchronously inside `apply_event`. Used by tests
    /// and by callers that do their own batching.
    pub fn synchronous() -> Self {
        Self {
            coalescer: CoalescerConfig { window: std::time::Duration::ZERO, ..Default::default() },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub validation_drops: u64,
    pub duplicate_drops: u64,
    pub dedup: DedupStats,
    pub ordering: OrderingStats,
    pub coalescer: CoalescerMetrics,
    pub router: RouterDiagnostics,
}

/// The full ingest path: validator → deduplicator → ordering buffer →
/// coalescer → router → stores.
///
/// Everything is owned and single-threaded; the caller drives timers by
/// sleeping until [`next_deadline`](Self::next_deadline) and calling
/// [`pump`](Self::pump), or by handing control to
/// [`run_until_idle`](Self::run_until_idle).
#[derive(Debug)]
pub struct EventPipeline {
    dedup: Deduplicator,
    ordering: OrderingBuffer,
    coalescer: Coalescer,
    router: EventRouter,
    stores: Stores,
    validation_drops: u64,
    duplicate_drops: u64,
}

impl EventPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            dedup: Deduplicator::new(config.dedup_capacity),
            ordering: OrderingBuffer::new(config.ordering),
            coalescer: Coalescer::new(config.coalescer),
            router: EventRouter::new(config.router),
            stores: Stores::new(),
            validation_drops: 0,
            duplicate_drops: 0,
        }
    }

    /// Read-only access to the entity and request stores.
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    // ── Ingest ────────────────────────────────────────────────────────────────

    /// Run one event through validation, dedup and ordering, then feed the
    /// admitted events into the coalescer. Returns the events admitted by
    /// this call; with a zero coalescer window they are also routed to the
    /// stores before this returns, otherwise routing happens when the batch
    /// window closes.
    pub fn apply_event(&mut self, event: ServerEvent, view: &mut dyn StoreView) -> Vec<ServerEvent> {
        self.apply_event_at(event, Instant::now(), now_ms(), view)
    }

    /// Deterministic variant of [`apply_event`](Self::apply_event) used by
    /// tests and the timer driver.
    pub fn apply_event_at(
        &mut self,
        event: ServerEvent,
        now: Instant,
        now_ms: u64,
        view: &mut dyn StoreView,
    ) -> Vec<ServerEvent> {
        if let Err(reason) = validate(&event) {
            self.validation_drops += 1;
            warn!(event_id = %event.event_id, kind = %event.kind, %reason, "dropping invalid event");
            return vec![];
        }
        if self.dedup.is_duplicate(&event.event_id, now_ms) {
            self.duplicate_drops += 1;
            debug!(event_id = %event.event_id, "duplicate event dropped");
            return vec![];
        }

        let admitted = self.ordering.admit(event, now);
        for ev in &admitted {
            self.coalescer.add(ev.clone(), now);
        }
        self.route_if_due(now, now_ms, view);
        admitted
    }

    // ── Timer driving ─────────────────────────────────────────────────────────

    /// The earliest pending deadline: a gap-release timeout or the close of
    /// the current coalescer window.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.ordering.next_deadline(), self.coalescer.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Process every deadline that has passed: force-release timed-out gap
    /// events into the coalescer and route the batch if its window closed.
    pub fn pump(&mut self, view: &mut dyn StoreView) {
        self.pump_at(Instant::now(), now_ms(), view);
    }

    pub fn pump_at(&mut self, now: Instant, now_ms: u64, view: &mut dyn StoreView) {
        let recovered = self.ordering.expire_due(now);
        for ev in recovered {
            self.coalescer.add(ev, now);
        }
        self.route_if_due(now, now_ms, view);
    }

    /// Drive timers until no deadline remains. Intended for the embedding
    /// event loop: `select!` this against the next incoming event.
    pub async fn run_until_idle(&mut self, view: &mut dyn StoreView) {
        while let Some(deadline) = self.next_deadline() {
            tokio::time::sleep_until(deadline).await;
            self.pump(view);
        }
    }

    fn route_if_due(&mut self, now: Instant, now_ms: u64, view: &mut dyn StoreView) {
        if self.coalescer.deadline().is_some_and(|d| d <= now) {
            let batch = self.coalescer.drain();
            if !batch.is_empty() {
                self.router.apply_batch(&mut self.stores, &batch, now_ms);
                self.notify(view);
            }
        }
    }

    fn notify(&mut self, view: &mut dyn StoreView) {
        let deltas = self.stores.drain_deltas();
        if !deltas.is_empty() {
            view.on_batch(&deltas);
        }
    }

    // ── Optimistic gateway ────────────────────────────────────────────────────
    //
    // The issuer mutates the stores exclusively through these, so the
    // router remains the stores' single mutator.

    pub fn issue_message(
        &mut self,
        message: Message,
        view: &mut dyn StoreView,
    ) -> Result<(), StoreError> {
        let result = self.router.upsert_optimistic_message(&mut self.stores, message);
        self.notify(view);
        result
    }

    pub fn issue_part(&mut self, part: Part, view: &mut dyn StoreView) -> Result<(), StoreError> {
        let result = self.router.upsert_optimistic_part(&mut self.stores, part);
        self.notify(view);
        result
    }

    /// Upsert the canonical session resolved from the chat response header,
    /// preserving any status a racing event already set.
    pub fn adopt_session(&mut self, session_id: &str, directory: &str, view: &mut dyn StoreView) {
        self.router.adopt_session(&mut self.stores, session_id, directory);
        self.notify(view);
    }

    pub fn migrate_message_session(
        &mut self,
        message_id: &str,
        new_session: &str,
        view: &mut dyn StoreView,
    ) -> Result<(), StoreError> {
        let result = self.router.migrate_message_session(&mut self.stores, message_id, new_session);
        self.notify(view);
        result
    }

    pub fn discard_optimistic(
        &mut self,
        message_ids: &[String],
        part_ids: &[String],
        view: &mut dyn StoreView,
    ) {
        self.router.discard_optimistic(&mut self.stores, message_ids, part_ids);
        self.notify(view);
    }

    pub fn reap_stale_optimistics(
        &mut self,
        session_id: &str,
        now_ms: u64,
        older_than_ms: u64,
        view: &mut dyn StoreView,
    ) -> (usize, usize) {
        let removed =
            self.router.reap_stale_optimistics(&mut self.stores, session_id, now_ms, older_than_ms);
        self.notify(view);
        removed
    }

    /// External delete interface: remove a message and cascade to its parts.
    pub fn delete_message(&mut self, message_id: &str, view: &mut dyn StoreView) -> bool {
        let removed = self.stores.entities.remove_message(message_id);
        self.notify(view);
        removed
    }

    /// Drop a session row that ended up with no messages, e.g. the
    /// placeholder session of a failed turn.
    pub fn retire_session_if_empty(&mut self, session_id: &str, view: &mut dyn StoreView) -> bool {
        if !self.stores.entities.has_session(session_id)
            || !self.stores.entities.messages_in(session_id).is_empty()
        {
            return false;
        }
        let removed = self.stores.entities.remove_session(session_id);
        self.notify(view);
        removed
    }

    // ── State clearing ────────────────────────────────────────────────────────

    /// Forget the ordering buffer, pending parts and retry tracker for one
    /// session. Entity rows are untouched.
    pub fn clear_session_state(&mut self, session_id: &str) {
        self.ordering.clear_session(session_id);
        self.router.clear_session(session_id);
    }

    /// Reset every buffer, cache and sequence counter. Entity rows are
    /// untouched; queued coalescer events are dropped silently.
    pub fn clear_all_processing_state(&mut self) {
        self.dedup.clear();
        self.ordering.clear_all();
        let _ = self.coalescer.flush();
        self.router.clear_all();
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    pub fn ordering_stats(&self) -> OrderingStats {
        self.ordering.stats()
    }

    pub fn session_ordering_stats(&self, session_id: &str) -> Option<SessionOrderingStats> {
        self.ordering.session_stats(session_id)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            validation_drops: self.validation_drops,
            duplicate_drops: self.duplicate_drops,
            dedup: self.dedup.stats(),
            ordering: self.ordering.stats(),
            coalescer: self.coalescer.metrics(),
            router: self.router.diagnostics(),
        }
    }
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}
