// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use tracing::{debug, trace, warn};
use weft_protocol::{
    EventPayload, Message, MessageInfo, Part, PartBody, ServerEvent, Session, SessionStatus,
};
use weft_store::{StoreError, Stores};

use crate::correlate::CORRELATION_WINDOW_MS;
use crate::reconcile::{reconcile_messages, reconcile_parts};

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Correlation window for optimistic matching and orphan cleanup.
    pub window_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { window_ms: CORRELATION_WINDOW_MS }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterDiagnostics {
    pub retry_attempts: u64,
    pub retry_recovered: u64,
    pub retry_exhausted: u64,
    pub orphaned_messages_removed: u64,
    pub orphaned_parts_removed: u64,
    pub deferred_parts: u64,
    pub store_errors: u64,
    pub dropped_events: u64,
    pub last_heartbeat_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RetrySignature {
    attempt: u32,
    next: u64,
    message: String,
}

/// Dispatches ordered, deduplicated events to store mutations.
///
/// The router is the only mutator of the stores. Every event in a batch is
/// applied in isolation: a store error is logged with the event id and kind
/// and the rest of the batch continues. Parts that arrive before their
/// parent message are parked in the pending buffer and flushed when the
/// message is created.
#[derive(Debug, Default)]
pub struct EventRouter {
    config: RouterConfig,
    /// Parts waiting for their parent message, keyed by message id.
    pending_parts: HashMap<String, Vec<Part>>,
    /// Last retry signature per session, to count distinct attempts once.
    retry_state: HashMap<String, RetrySignature>,
    diags: RouterDiagnostics,
}

impl EventRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn diagnostics(&self) -> RouterDiagnostics {
        self.diags
    }

    pub fn pending_part_count(&self) -> usize {
        self.pending_parts.values().map(Vec::len).sum()
    }

    // ── Batch application ─────────────────────────────────────────────────────

    pub fn apply_batch(&mut self, stores: &mut Stores, batch: &[ServerEvent], now_ms: u64) {
        for event in batch {
            if let Err(err) = self.apply_event(stores, event, now_ms) {
                self.diags.store_errors += 1;
                warn!(
                    event_id = %event.event_id,
                    kind = %event.kind,
                    error = %err,
                    "store mutation failed, continuing batch"
                );
            }
        }
    }

    fn apply_event(
        &mut self,
        stores: &mut Stores,
        event: &ServerEvent,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let payload = match event.payload() {
            Ok(p) => p,
            Err(err) => {
                // The validator runs upstream; a parse failure here means a
                // malformed event slipped in through a non-pipeline path.
                warn!(event_id = %event.event_id, error = %err, "unparseable event dropped");
                self.diags.dropped_events += 1;
                return Ok(());
            }
        };
        match payload {
            EventPayload::ServerConnected | EventPayload::ServerHeartbeat => {
                self.diags.last_heartbeat_ms = Some(event.timestamp);
            }
            EventPayload::SessionCreated { session_id, directory } => {
                self.upsert_session_keeping_status(stores, &session_id, &directory);
            }
            EventPayload::SessionUpdated { session_id, status, directory } => {
                let directory = directory
                    .or_else(|| stores.entities.session(&session_id).map(|s| s.directory.clone()))
                    .unwrap_or_else(|| "default".to_string());
                self.upsert_session_keeping_status(stores, &session_id, &directory);
                if let Some(status) = status {
                    self.set_status(stores, &session_id, status);
                }
            }
            EventPayload::SessionStatus { session_id, status } => {
                self.handle_session_status(stores, &session_id, status, event, now_ms);
            }
            EventPayload::MessageUpdated { info, session_id } => {
                self.handle_message_updated(stores, info, session_id, event, now_ms)?;
            }
            EventPayload::PartUpdated { part } => {
                if part.id.is_empty() || part.message_id.is_empty() || part.session_id.is_empty() {
                    warn!(event_id = %event.event_id, "part event with empty ids dropped");
                    self.diags.dropped_events += 1;
                    return Ok(());
                }
                let part = part.with_transient_metadata(event.sequence, event.timestamp);
                self.apply_canonical_part(stores, part, now_ms)?;
            }
            EventPayload::PartRemoved { part_id, .. } => {
                // Absent parts are silently ignored.
                stores.entities.remove_part(&part_id);
            }
            EventPayload::PermissionAsked(asked) => {
                stores.requests.insert_permission(asked, event.timestamp);
            }
            EventPayload::PermissionReplied { request_id, reply, .. } => {
                stores.requests.resolve_permission(&request_id, reply);
            }
            EventPayload::QuestionAsked(asked) => {
                stores.requests.insert_question(asked, event.timestamp);
            }
            EventPayload::QuestionReplied { request_id, reply, .. } => {
                stores.requests.answer_question(&request_id, reply);
            }
            EventPayload::QuestionRejected { request_id, reason, .. } => {
                stores.requests.reject_question(&request_id, reason);
            }
            EventPayload::Unknown => {
                trace!(kind = %event.kind, "unknown event kind ignored");
            }
        }
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    fn ensure_session(&mut self, stores: &mut Stores, session_id: &str, directory: Option<&str>) {
        if !stores.entities.has_session(session_id) {
            stores
                .entities
                .upsert_session(Session::new(session_id, directory.unwrap_or("default")));
        }
    }

    fn upsert_session_keeping_status(
        &mut self,
        stores: &mut Stores,
        session_id: &str,
        directory: &str,
    ) {
        let status = stores
            .entities
            .session(session_id)
            .map(|s| s.status.clone())
            .unwrap_or(SessionStatus::Idle);
        stores.entities.upsert_session(Session {
            id: session_id.to_string(),
            directory: directory.to_string(),
            status,
        });
    }

    fn set_status(&mut self, stores: &mut Stores, session_id: &str, status: SessionStatus) {
        if let Some(session) = stores.entities.session(session_id) {
            let mut session = session.clone();
            session.status = status;
            stores.entities.upsert_session(session);
        }
    }

    fn handle_session_status(
        &mut self,
        stores: &mut Stores,
        session_id: &str,
        status: SessionStatus,
        event: &ServerEvent,
        now_ms: u64,
    ) {
        self.ensure_session(stores, session_id, event.directory.as_deref());
        let was_retrying = self.retry_state.contains_key(session_id);

        match &status {
            SessionStatus::Retry { attempt, message, next } => {
                let signature =
                    RetrySignature { attempt: *attempt, next: *next, message: message.clone() };
                if self.retry_state.get(session_id) != Some(&signature) {
                    self.diags.retry_attempts += 1;
                    debug!(session = %session_id, attempt, "retry attempt");
                    self.retry_state.insert(session_id.to_string(), signature);
                }
            }
            SessionStatus::Idle => {
                if was_retrying {
                    if self.last_turn_errored(stores, session_id) {
                        self.diags.retry_exhausted += 1;
                        debug!(session = %session_id, "retry exhausted");
                    } else {
                        self.diags.retry_recovered += 1;
                        debug!(session = %session_id, "retry recovered");
                    }
                    self.retry_state.remove(session_id);
                }
            }
            SessionStatus::Busy => {}
        }

        let entering_idle = status.is_idle();
        self.set_status(stores, session_id, status);
        if entering_idle {
            self.orphan_cleanup(stores, session_id, now_ms);
        }
    }

    /// A retry burst ended badly when the latest assistant message carries
    /// an error field or an error part.
    fn last_turn_errored(&self, stores: &Stores, session_id: &str) -> bool {
        let Some(assistant) = stores.entities.latest_assistant_in(session_id) else {
            return false;
        };
        if assistant.error.is_some() {
            return true;
        }
        stores
            .entities
            .parts_of(&assistant.id)
            .iter()
            .any(|p| matches!(p.body, PartBody::Error { .. }))
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    fn handle_message_updated(
        &mut self,
        stores: &mut Stores,
        info: MessageInfo,
        props_session: Option<String>,
        event: &ServerEvent,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let resolved = info
            .session_id
            .clone()
            .or(props_session)
            .or_else(|| event.session_id.clone())
            .or_else(|| {
                info.parent_id
                    .as_deref()
                    .and_then(|p| stores.entities.message(p))
                    .map(|m| m.session_id.clone())
            });
        let Some(session_id) = resolved else {
            warn!(event_id = %event.event_id, message = %info.id, "message without resolvable session dropped");
            self.diags.dropped_events += 1;
            return Ok(());
        };
        self.ensure_session(stores, &session_id, event.directory.as_deref());

        let canonical = Message::from_info(info, &session_id);
        let canonical_id = canonical.id.clone();

        let optimistics: Vec<Message> =
            stores.entities.optimistic_messages_in(&session_id).into_iter().cloned().collect();
        let opt_refs: Vec<&Message> = optimistics.iter().collect();
        let plan = reconcile_messages(
            &[canonical],
            &opt_refs,
            now_ms,
            self.config.window_ms,
            event.timestamp,
        );

        // Canonical row first so re-parented parts keep a valid FK.
        for message in plan.to_upsert {
            stores.entities.upsert_message(message)?;
        }
        for opt_id in plan.to_remove {
            let parts: Vec<Part> =
                stores.entities.parts_of(&opt_id).into_iter().cloned().collect();
            for mut part in parts {
                stores.entities.remove_part(&part.id);
                part.message_id = canonical_id.clone();
                stores.entities.upsert_part(part)?;
            }
            stores.entities.remove_message(&opt_id);
        }

        if let Some(pending) = self.pending_parts.remove(&canonical_id) {
            debug!(message = %canonical_id, count = pending.len(), "flushing deferred parts");
            for part in pending {
                // Optimistic deferred parts must not be laundered through
                // the canonical path, or they would lose their metadata.
                if part.is_optimistic() {
                    self.upsert_optimistic_part(stores, part)?;
                } else {
                    self.apply_canonical_part(stores, part, now_ms)?;
                }
            }
        }
        Ok(())
    }

    // ── Parts ─────────────────────────────────────────────────────────────────

    fn apply_canonical_part(
        &mut self,
        stores: &mut Stores,
        part: Part,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        if !stores.entities.has_message(&part.message_id) {
            self.defer_part(part);
            return Ok(());
        }

        if let Some(existing) = stores.entities.part(&part.id) {
            if !existing.is_optimistic()
                && existing.without_transient_metadata() == part.without_transient_metadata()
            {
                trace!(part = %part.id, "canonical part unchanged, skipping");
                return Ok(());
            }
        }

        let optimistics: Vec<Part> =
            stores.entities.optimistic_parts_of(&part.message_id).into_iter().cloned().collect();
        let opt_refs: Vec<&Part> = optimistics.iter().collect();
        let plan = reconcile_parts(&[part], &opt_refs, now_ms, self.config.window_ms);

        for opt_id in &plan.to_remove {
            stores.entities.remove_part(opt_id);
        }
        for part in plan.to_upsert {
            stores.entities.upsert_part(part)?;
        }
        Ok(())
    }

    fn defer_part(&mut self, part: Part) {
        debug!(part = %part.id, message = %part.message_id, "parent missing, deferring part");
        let queue = self.pending_parts.entry(part.message_id.clone()).or_default();
        if let Some(existing) = queue.iter_mut().find(|p| p.id == part.id) {
            *existing = part;
        } else {
            queue.push(part);
            self.diags.deferred_parts += 1;
        }
    }

    // ── Optimistic gateway (used by the issuer) ───────────────────────────────

    /// Upsert the canonical session resolved outside the event pipeline
    /// (chat response header), preserving any status already set by a
    /// racing `session.status` event.
    pub fn adopt_session(&mut self, stores: &mut Stores, session_id: &str, directory: &str) {
        self.upsert_session_keeping_status(stores, session_id, directory);
    }

    /// Insert a locally-fabricated message, creating a stub session on the
    /// fly so the FK invariant holds for placeholder sessions.
    pub fn upsert_optimistic_message(
        &mut self,
        stores: &mut Stores,
        message: Message,
    ) -> Result<(), StoreError> {
        let session_id = message.session_id.clone();
        self.ensure_session(stores, &session_id, None);
        stores.entities.upsert_message(message)
    }

    /// Insert a locally-fabricated part. Skipped entirely when a canonical
    /// part with the same id already landed; deferred when the parent
    /// message has not arrived yet.
    pub fn upsert_optimistic_part(
        &mut self,
        stores: &mut Stores,
        part: Part,
    ) -> Result<(), StoreError> {
        if let Some(existing) = stores.entities.part(&part.id) {
            if !existing.is_optimistic() {
                trace!(part = %part.id, "canonical part present, skipping optimistic upsert");
                return Ok(());
            }
        }
        if !stores.entities.has_message(&part.message_id) {
            self.defer_part(part);
            return Ok(());
        }
        stores.entities.upsert_part(part)
    }

    /// Move an optimistic message (and its parts) to the canonical session
    /// resolved from the chat response header, retiring the placeholder
    /// session if it is left empty.
    pub fn migrate_message_session(
        &mut self,
        stores: &mut Stores,
        message_id: &str,
        new_session: &str,
    ) -> Result<(), StoreError> {
        let Some(mut message) = stores.entities.message(message_id).cloned() else {
            return Ok(());
        };
        let old_session = message.session_id.clone();
        if old_session == new_session {
            return Ok(());
        }
        message.session_id = new_session.to_string();
        stores.entities.upsert_message(message)?;

        let parts: Vec<Part> = stores.entities.parts_of(message_id).into_iter().cloned().collect();
        for mut part in parts {
            part.session_id = new_session.to_string();
            stores.entities.upsert_part(part)?;
        }
        for part in self.pending_parts.values_mut().flatten() {
            if part.session_id == old_session {
                part.session_id = new_session.to_string();
            }
        }
        if stores.entities.messages_in(&old_session).is_empty() {
            stores.entities.remove_session(&old_session);
        }
        Ok(())
    }

    /// Remove specific optimistic entities, both from the stores and from
    /// the pending buffer. Used to clean up a failed or aborted turn.
    pub fn discard_optimistic(
        &mut self,
        stores: &mut Stores,
        message_ids: &[String],
        part_ids: &[String],
    ) {
        for part_id in part_ids {
            stores.entities.remove_part(part_id);
            for queue in self.pending_parts.values_mut() {
                queue.retain(|p| &p.id != part_id);
            }
        }
        self.pending_parts.retain(|_, queue| !queue.is_empty());
        for message_id in message_ids {
            stores.entities.remove_message(message_id);
            self.pending_parts.remove(message_id);
        }
    }

    /// Remove every optimistic part/message in the session older than
    /// `older_than_ms`. `stop()` uses a small floor; orphan cleanup uses the
    /// correlation window.
    pub fn reap_stale_optimistics(
        &mut self,
        stores: &mut Stores,
        session_id: &str,
        now_ms: u64,
        older_than_ms: u64,
    ) -> (usize, usize) {
        let stale = |meta: &Option<weft_protocol::OptimisticMeta>| {
            meta.as_ref().is_some_and(|m| now_ms.saturating_sub(m.timestamp) > older_than_ms)
        };

        let part_ids: Vec<String> = stores
            .entities
            .optimistic_parts_in_session(session_id)
            .iter()
            .filter(|p| stale(&p.optimistic))
            .map(|p| p.id.clone())
            .collect();
        for id in &part_ids {
            stores.entities.remove_part(id);
        }

        let message_ids: Vec<String> = stores
            .entities
            .optimistic_messages_in(session_id)
            .iter()
            .filter(|m| stale(&m.optimistic))
            .map(|m| m.id.clone())
            .collect();
        for id in &message_ids {
            // Cascade removes any remaining parts first.
            stores.entities.remove_message(id);
        }
        (message_ids.len(), part_ids.len())
    }

    fn orphan_cleanup(&mut self, stores: &mut Stores, session_id: &str, now_ms: u64) {
        let (messages, parts) =
            self.reap_stale_optimistics(stores, session_id, now_ms, self.config.window_ms);
        self.diags.orphaned_messages_removed += messages as u64;
        self.diags.orphaned_parts_removed += parts as u64;
        if messages > 0 || parts > 0 {
            debug!(session = %session_id, messages, parts, "orphan cleanup on idle");
        }
    }

    // ── State clearing ────────────────────────────────────────────────────────

    pub fn clear_session(&mut self, session_id: &str) {
        self.pending_parts.retain(|_, queue| {
            queue.retain(|p| p.session_id != session_id);
            !queue.is_empty()
        });
        self.retry_state.remove(session_id);
    }

    pub fn clear_all(&mut self) {
        self.pending_parts.clear();
        self.retry_state.clear();
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
