// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use tracing::debug;
use weft_protocol::{PermissionAsked, PermissionReply, QuestionAsked};

use crate::delta::StoreDelta;

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionStatus {
    Pending,
    Approved { always: bool },
    Denied,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRecord {
    pub request: PermissionAsked,
    pub status: PermissionStatus,
    /// Epoch-ms time the request was asked (envelope timestamp).
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuestionStatus {
    Pending,
    Answered { reply: String },
    Rejected { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionRecord {
    pub request: QuestionAsked,
    pub status: QuestionStatus,
    pub timestamp: u64,
}

/// Permission and question records routed through the event pipeline,
/// with an insertion-ordered pending queue per session so the UI can
/// surface prompts in the order the server raised them.
#[derive(Debug, Default)]
pub struct RequestStore {
    permissions: HashMap<String, PermissionRecord>,
    questions: HashMap<String, QuestionRecord>,
    pending_permissions: HashMap<String, Vec<String>>,
    pending_questions: HashMap<String, Vec<String>>,
    deltas: Vec<StoreDelta>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Permissions ───────────────────────────────────────────────────────────

    pub fn insert_permission(&mut self, asked: PermissionAsked, timestamp: u64) {
        let id = asked.id.clone();
        let session_id = asked.session_id.clone();
        let record = PermissionRecord { request: asked, status: PermissionStatus::Pending, timestamp };
        self.deltas.push(StoreDelta::PermissionChanged(record.clone()));
        // Re-asked requests keep their original queue position.
        if self.permissions.insert(id.clone(), record).is_none() {
            self.pending_permissions.entry(session_id).or_default().push(id);
        }
    }

    /// Resolve a pending permission. Returns `false` for unknown request
    /// ids, which the router drops.
    pub fn resolve_permission(&mut self, request_id: &str, reply: PermissionReply) -> bool {
        let Some(record) = self.permissions.get_mut(request_id) else {
            debug!(request_id, "reply for unknown permission request");
            return false;
        };
        record.status = match reply {
            PermissionReply::Once => PermissionStatus::Approved { always: false },
            PermissionReply::Always => PermissionStatus::Approved { always: true },
            PermissionReply::Reject => PermissionStatus::Denied,
        };
        let record = record.clone();
        self.unqueue_permission(&record.request.session_id, request_id);
        self.deltas.push(StoreDelta::PermissionChanged(record));
        true
    }

    pub fn permission(&self, id: &str) -> Option<&PermissionRecord> {
        self.permissions.get(id)
    }

    /// Pending permissions of a session, oldest ask first.
    pub fn pending_permissions(&self, session_id: &str) -> Vec<&PermissionRecord> {
        self.pending_permissions
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| self.permissions.get(id)).collect())
            .unwrap_or_default()
    }

    fn unqueue_permission(&mut self, session_id: &str, request_id: &str) {
        if let Some(ids) = self.pending_permissions.get_mut(session_id) {
            ids.retain(|id| id != request_id);
        }
    }

    // ── Questions ─────────────────────────────────────────────────────────────

    pub fn insert_question(&mut self, asked: QuestionAsked, timestamp: u64) {
        let id = asked.id.clone();
        let session_id = asked.session_id.clone();
        let record = QuestionRecord { request: asked, status: QuestionStatus::Pending, timestamp };
        self.deltas.push(StoreDelta::QuestionChanged(record.clone()));
        if self.questions.insert(id.clone(), record).is_none() {
            self.pending_questions.entry(session_id).or_default().push(id);
        }
    }

    pub fn answer_question(&mut self, request_id: &str, reply: String) -> bool {
        self.finish_question(request_id, QuestionStatus::Answered { reply })
    }

    pub fn reject_question(&mut self, request_id: &str, reason: Option<String>) -> bool {
        self.finish_question(request_id, QuestionStatus::Rejected { reason })
    }

    fn finish_question(&mut self, request_id: &str, status: QuestionStatus) -> bool {
        let Some(record) = self.questions.get_mut(request_id) else {
            debug!(request_id, "reply for unknown question request");
            return false;
        };
        record.status = status;
        let record = record.clone();
        if let Some(ids) = self.pending_questions.get_mut(&record.request.session_id) {
            ids.retain(|id| id != request_id);
        }
        self.deltas.push(StoreDelta::QuestionChanged(record));
        true
    }

    pub fn question(&self, id: &str) -> Option<&QuestionRecord> {
        self.questions.get(id)
    }

    /// Pending questions of a session, oldest ask first.
    pub fn pending_questions(&self, session_id: &str) -> Vec<&QuestionRecord> {
        self.pending_questions
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| self.questions.get(id)).collect())
            .unwrap_or_default()
    }

    // ── Batch deltas ──────────────────────────────────────────────────────────

    pub fn take_deltas(&mut self) -> Vec<StoreDelta> {
        std::mem::take(&mut self.deltas)
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn asked(id: &str, session: &str) -> PermissionAsked {
        PermissionAsked {
            id: id.into(),
            session_id: session.into(),
            permission: "shell".into(),
            patterns: vec!["*".into()],
            always: vec![],
            metadata: None,
            tool: None,
        }
    }

    fn question(id: &str, session: &str) -> QuestionAsked {
        QuestionAsked {
            id: id.into(),
            session_id: session.into(),
            questions: vec!["Proceed?".into()],
            tool: None,
        }
    }

    #[test]
    fn pending_permissions_keep_ask_order() {
        let mut store = RequestStore::new();
        store.insert_permission(asked("r1", "s1"), 1);
        store.insert_permission(asked("r2", "s1"), 2);
        store.insert_permission(asked("r3", "s2"), 3);
        let ids: Vec<_> =
            store.pending_permissions("s1").iter().map(|r| r.request.id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2"]);
        assert_eq!(store.pending_permissions("s2").len(), 1);
    }

    #[test]
    fn reply_resolves_and_unqueues() {
        let mut store = RequestStore::new();
        store.insert_permission(asked("r1", "s1"), 1);
        assert!(store.resolve_permission("r1", PermissionReply::Always));
        assert!(store.pending_permissions("s1").is_empty());
        assert_eq!(
            store.permission("r1").unwrap().status,
            PermissionStatus::Approved { always: true }
        );
    }

    #[test]
    fn unknown_request_id_is_dropped() {
        let mut store = RequestStore::new();
        assert!(!store.resolve_permission("ghost", PermissionReply::Once));
        assert!(!store.answer_question("ghost", "yes".into()));
    }

    #[test]
    fn re_asked_permission_keeps_queue_position() {
        let mut store = RequestStore::new();
        store.insert_permission(asked("r1", "s1"), 1);
        store.insert_permission(asked("r2", "s1"), 2);
        store.insert_permission(asked("r1", "s1"), 3);
        let ids: Vec<_> =
            store.pending_permissions("s1").iter().map(|r| r.request.id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2"]);
    }

    #[test]
    fn question_rejection_records_reason() {
        let mut store = RequestStore::new();
        store.insert_question(question("q1", "s1"), 5);
        assert!(store.reject_question("q1", Some("cancelled".into())));
        assert_eq!(
            store.question("q1").unwrap().status,
            QuestionStatus::Rejected { reason: Some("cancelled".into()) }
        );
        assert!(store.pending_questions("s1").is_empty());
    }

    #[test]
    fn deltas_cover_insert_and_resolve() {
        let mut store = RequestStore::new();
        store.insert_question(question("q1", "s1"), 5);
        store.answer_question("q1", "ok".into());
        let deltas = store.take_deltas();
        assert_eq!(deltas.len(), 2);
        match &deltas[1] {
            StoreDelta::QuestionChanged(r) => {
                assert_eq!(r.status, QuestionStatus::Answered { reply: "ok".into() });
            }
            other => panic!("unexpected delta {other:?}"),
        }
    }
}
