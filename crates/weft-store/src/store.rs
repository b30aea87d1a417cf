// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;
use weft_protocol::{Message, Part, Role, Session};

use crate::delta::StoreDelta;
use crate::requests::RequestStore;

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("message `{message_id}` references missing session `{session_id}`")]
    MissingSession { session_id: String, message_id: String },

    #[error("part `{part_id}` references missing message `{message_id}`")]
    MissingMessage { message_id: String, part_id: String },
}

/// The three entity tables plus their index maps.
///
/// The store is the exclusive owner of all Session/Message/Part records;
/// the event router is its only mutator. Every mutation appends a
/// [`StoreDelta`] to the current batch, drained by the pipeline after each
/// applied batch. Foreign keys are enforced with explicit `Result`s so the
/// router can defer or stub instead of unwinding.
#[derive(Debug, Default)]
pub struct EntityStore {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Message>,
    parts: HashMap<String, Part>,
    /// Message ids per session, in insertion order.
    messages_by_session: HashMap<String, Vec<String>>,
    /// Part ids per message, in insertion order.
    parts_by_message: HashMap<String, Vec<String>>,
    deltas: Vec<StoreDelta>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn upsert_session(&mut self, session: Session) {
        trace!(session = %session.id, "session upsert");
        self.deltas.push(StoreDelta::SessionUpserted(session.clone()));
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove a session and everything under it. The event pipeline never
    /// calls this; it exists for the external delete interface and for
    /// retiring placeholder sessions during optimistic migration.
    pub fn remove_session(&mut self, id: &str) -> bool {
        if self.sessions.remove(id).is_none() {
            return false;
        }
        for message_id in self.messages_by_session.remove(id).unwrap_or_default() {
            self.remove_message_row(&message_id);
        }
        self.deltas.push(StoreDelta::SessionRemoved { id: id.to_string() });
        true
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Insert or update a message. The referenced session must exist; the
    /// router creates stubs before calling this.
    pub fn upsert_message(&mut self, message: Message) -> Result<(), StoreError> {
        if !self.sessions.contains_key(&message.session_id) {
            return Err(StoreError::MissingSession {
                session_id: message.session_id.clone(),
                message_id: message.id.clone(),
            });
        }
        if let Some(existing) = self.messages.get(&message.id) {
            if existing.session_id != message.session_id {
                // Session migration: fix the index before the overwrite.
                let old = existing.session_id.clone();
                if let Some(ids) = self.messages_by_session.get_mut(&old) {
                    ids.retain(|m| m != &message.id);
                }
                self.index_message(&message.session_id, &message.id);
            }
        } else {
            self.index_message(&message.session_id, &message.id);
        }
        trace!(message = %message.id, session = %message.session_id, "message upsert");
        self.deltas.push(StoreDelta::MessageUpserted(message.clone()));
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn has_message(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    /// Remove a message and cascade to its parts in the same transition.
    /// Returns `false` if the message was already gone.
    pub fn remove_message(&mut self, id: &str) -> bool {
        let Some(message) = self.messages.get(id) else {
            return false;
        };
        let session_id = message.session_id.clone();
        if let Some(ids) = self.messages_by_session.get_mut(&session_id) {
            ids.retain(|m| m != id);
        }
        self.remove_message_row(id);
        true
    }

    /// Shared removal path: cascade parts, drop the row, emit the delta.
    /// Callers are responsible for the session index.
    fn remove_message_row(&mut self, id: &str) {
        let Some(message) = self.messages.remove(id) else {
            return;
        };
        for part_id in self.parts_by_message.remove(id).unwrap_or_default() {
            if self.parts.remove(&part_id).is_some() {
                self.deltas.push(StoreDelta::PartRemoved {
                    id: part_id,
                    message_id: id.to_string(),
                });
            }
        }
        self.deltas.push(StoreDelta::MessageRemoved { id: id.to_string(), session_id: message.session_id });
    }

    /// Messages of a session in insertion order.
    pub fn messages_in(&self, session_id: &str) -> Vec<&Message> {
        self.messages_by_session
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| self.messages.get(id)).collect())
            .unwrap_or_default()
    }

    /// The most recently inserted assistant message of a session.
    pub fn latest_assistant_in(&self, session_id: &str) -> Option<&Message> {
        self.messages_in(session_id)
            .into_iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }

    pub fn optimistic_messages_in(&self, session_id: &str) -> Vec<&Message> {
        self.messages_in(session_id)
            .into_iter()
            .filter(|m| m.is_optimistic())
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    // ── Parts ─────────────────────────────────────────────────────────────────

    /// Insert or update a part. The referenced message must exist; the
    /// router parks parts in its pending buffer instead of calling this
    /// when the parent has not arrived yet.
    pub fn upsert_part(&mut self, part: Part) -> Result<(), StoreError> {
        if !self.messages.contains_key(&part.message_id) {
            return Err(StoreError::MissingMessage {
                message_id: part.message_id.clone(),
                part_id: part.id.clone(),
            });
        }
        if let Some(existing) = self.parts.get(&part.id) {
            if existing.message_id != part.message_id {
                let old = existing.message_id.clone();
                if let Some(ids) = self.parts_by_message.get_mut(&old) {
                    ids.retain(|p| p != &part.id);
                }
                self.index_part(&part.message_id, &part.id);
            }
        } else {
            self.index_part(&part.message_id, &part.id);
        }
        trace!(part = %part.id, message = %part.message_id, "part upsert");
        self.deltas.push(StoreDelta::PartUpserted(part.clone()));
        self.parts.insert(part.id.clone(), part);
        Ok(())
    }

    pub fn part(&self, id: &str) -> Option<&Part> {
        self.parts.get(id)
    }

    /// Remove a part; `false` if it was already gone.
    pub fn remove_part(&mut self, id: &str) -> bool {
        let Some(part) = self.parts.remove(id) else {
            return false;
        };
        if let Some(ids) = self.parts_by_message.get_mut(&part.message_id) {
            ids.retain(|p| p != id);
        }
        self.deltas.push(StoreDelta::PartRemoved { id: id.to_string(), message_id: part.message_id });
        true
    }

    /// Parts of a message in insertion order.
    pub fn parts_of(&self, message_id: &str) -> Vec<&Part> {
        self.parts_by_message
            .get(message_id)
            .map(|ids| ids.iter().filter_map(|id| self.parts.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn optimistic_parts_of(&self, message_id: &str) -> Vec<&Part> {
        self.parts_of(message_id).into_iter().filter(|p| p.is_optimistic()).collect()
    }

    /// All optimistic parts whose part record names the given session.
    pub fn optimistic_parts_in_session(&self, session_id: &str) -> Vec<&Part> {
        self.parts
            .values()
            .filter(|p| p.session_id == session_id && p.is_optimistic())
            .collect()
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    // ── Batch deltas ──────────────────────────────────────────────────────────

    pub fn take_deltas(&mut self) -> Vec<StoreDelta> {
        std::mem::take(&mut self.deltas)
    }

    // ── Index helpers ─────────────────────────────────────────────────────────

    fn index_message(&mut self, session_id: &str, message_id: &str) {
        let ids = self.messages_by_session.entry(session_id.to_string()).or_default();
        if !ids.iter().any(|m| m == message_id) {
            ids.push(message_id.to_string());
        }
    }

    fn index_part(&mut self, message_id: &str, part_id: &str) {
        let ids = self.parts_by_message.entry(message_id.to_string()).or_default();
        if !ids.iter().any(|p| p == part_id) {
            ids.push(part_id.to_string());
        }
    }
}

/// Entity tables plus the ancillary request store, sharing one delta batch.
#[derive(Debug, Default)]
pub struct Stores {
    pub entities: EntityStore,
    pub requests: RequestStore,
}

impl Stores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the deltas accumulated by both stores since the last call,
    /// entity changes first.
    pub fn drain_deltas(&mut self) -> Vec<StoreDelta> {
        let mut deltas = self.entities.take_deltas();
        deltas.extend(self.requests.take_deltas());
        deltas
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::{Part, Session};

    fn store_with_session() -> EntityStore {
        let mut store = EntityStore::new();
        store.upsert_session(Session::new("s1", "/repo"));
        store
    }

    fn message(id: &str, session: &str, role: Role) -> Message {
        Message {
            id: id.into(),
            role,
            session_id: session.into(),
            parent_id: None,
            time: None,
            model: None,
            provider: None,
            error: None,
            metadata: None,
            optimistic: None,
        }
    }

    // ── FK enforcement ────────────────────────────────────────────────────────

    #[test]
    fn message_without_session_is_rejected() {
        let mut store = EntityStore::new();
        let err = store.upsert_message(message("m1", "ghost", Role::User)).unwrap_err();
        assert_eq!(
            err,
            StoreError::MissingSession { session_id: "ghost".into(), message_id: "m1".into() }
        );
    }

    #[test]
    fn part_without_message_is_rejected() {
        let mut store = store_with_session();
        let err = store.upsert_part(Part::text("p1", "ghost", "s1", "x")).unwrap_err();
        assert_eq!(
            err,
            StoreError::MissingMessage { message_id: "ghost".into(), part_id: "p1".into() }
        );
    }

    // ── Cascade delete ────────────────────────────────────────────────────────

    #[test]
    fn remove_message_cascades_to_parts() {
        let mut store = store_with_session();
        store.upsert_message(message("m1", "s1", Role::Assistant)).unwrap();
        store.upsert_part(Part::text("p1", "m1", "s1", "a")).unwrap();
        store.upsert_part(Part::text("p2", "m1", "s1", "b")).unwrap();
        store.take_deltas();

        assert!(store.remove_message("m1"));
        assert_eq!(store.part_count(), 0);
        assert!(store.message("m1").is_none());

        // Parts removed before the message, in the same batch.
        let deltas = store.take_deltas();
        assert!(matches!(deltas.last(), Some(StoreDelta::MessageRemoved { .. })));
        assert_eq!(deltas.len(), 3);
    }

    #[test]
    fn remove_absent_message_is_a_noop() {
        let mut store = store_with_session();
        assert!(!store.remove_message("ghost"));
        assert!(store.take_deltas().iter().all(|d| matches!(d, StoreDelta::SessionUpserted(_))));
    }

    // ── Ordering and queries ──────────────────────────────────────────────────

    #[test]
    fn messages_in_preserves_insertion_order() {
        let mut store = store_with_session();
        for id in ["m1", "m2", "m3"] {
            store.upsert_message(message(id, "s1", Role::User)).unwrap();
        }
        let ids: Vec<_> = store.messages_in("s1").iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
    }

    #[test]
    fn latest_assistant_skips_user_turns() {
        let mut store = store_with_session();
        store.upsert_message(message("u1", "s1", Role::User)).unwrap();
        store.upsert_message(message("a1", "s1", Role::Assistant)).unwrap();
        store.upsert_message(message("u2", "s1", Role::User)).unwrap();
        assert_eq!(store.latest_assistant_in("s1").unwrap().id, "a1");
    }

    #[test]
    fn upsert_existing_message_does_not_duplicate_index() {
        let mut store = store_with_session();
        store.upsert_message(message("m1", "s1", Role::User)).unwrap();
        store.upsert_message(message("m1", "s1", Role::User)).unwrap();
        assert_eq!(store.messages_in("s1").len(), 1);
    }

    // ── Re-parenting ──────────────────────────────────────────────────────────

    #[test]
    fn part_upsert_with_new_parent_moves_index() {
        let mut store = store_with_session();
        store.upsert_message(message("m1", "s1", Role::Assistant)).unwrap();
        store.upsert_message(message("m2", "s1", Role::Assistant)).unwrap();
        store.upsert_part(Part::text("p1", "m1", "s1", "x")).unwrap();

        let mut moved = store.part("p1").unwrap().clone();
        moved.message_id = "m2".into();
        store.upsert_part(moved).unwrap();

        assert!(store.parts_of("m1").is_empty());
        assert_eq!(store.parts_of("m2").len(), 1);
    }

    #[test]
    fn message_migration_between_sessions_moves_index() {
        let mut store = store_with_session();
        store.upsert_session(Session::new("s2", "/other"));
        store.upsert_message(message("m1", "s1", Role::User)).unwrap();
        store.upsert_message(message("m1", "s2", Role::User)).unwrap();
        assert!(store.messages_in("s1").is_empty());
        assert_eq!(store.messages_in("s2").len(), 1);
    }

    // ── Session removal ───────────────────────────────────────────────────────

    #[test]
    fn remove_session_cascades_everything() {
        let mut store = store_with_session();
        store.upsert_message(message("m1", "s1", Role::User)).unwrap();
        store.upsert_part(Part::text("p1", "m1", "s1", "x")).unwrap();
        assert!(store.remove_session("s1"));
        assert_eq!(store.message_count(), 0);
        assert_eq!(store.part_count(), 0);
    }
}
