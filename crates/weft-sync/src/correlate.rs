// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use weft_protocol::{Message, Part, PartBody, Role};

/// Time bound within which an optimistic entity is eligible for
/// correlation; past it, the entity is stale and left to orphan cleanup.
pub const CORRELATION_WINDOW_MS: u64 = 30_000;

/// How a canonical entity was matched to an optimistic peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStrategy {
    /// Same row: the optimistic entity already carried the canonical id.
    ExactId,
    /// Role/parent/time-window correlation (messages).
    Correlation,
    /// Same message and tool `callID` (tool parts).
    ToolCallId,
    /// Only one text slot per message (text parts).
    TextSlot,
    /// Reasoning slot, optionally pinned by `reasoningId`.
    ReasoningSlot,
}

impl MatchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExactId => "exact-id",
            Self::Correlation => "correlation",
            Self::ToolCallId => "tool-call-id",
            Self::TextSlot => "text-slot",
            Self::ReasoningSlot => "reasoning-slot",
        }
    }
}

/// Correlation key for a message: stable across the optimistic/canonical
/// divide as long as role, parent and creation time line up.
pub fn message_key(role: Role, parent_id: Option<&str>, created_at: u64) -> String {
    format!("msg:{role}:{}:{created_at}", parent_id.unwrap_or("no-parent"))
}

/// Correlation key for a part; the discriminator is the tool `callID` or
/// `reasoningId` where one exists.
pub fn part_key(message_id: &str, part_kind: &str, discriminator: Option<&str>) -> String {
    format!("part:{message_id}:{part_kind}:{}", discriminator.unwrap_or("default"))
}

/// Match a canonical message against the session's optimistic messages.
///
/// Priority: exact id, then correlation (equal role and parent, creation
/// within `window_ms` of the optimistic issue time). `fallback_created_ms`
/// stands in for canonical messages that arrived without a `time` block.
pub fn match_message<'a>(
    canonical: &Message,
    optimistics: &[&'a Message],
    fallback_created_ms: u64,
    window_ms: u64,
) -> Option<(&'a Message, MatchStrategy)> {
    if let Some(exact) = optimistics.iter().find(|o| o.id == canonical.id).copied() {
        return Some((exact, MatchStrategy::ExactId));
    }
    let created = canonical.created_at(fallback_created_ms);
    optimistics
        .iter()
        .find(|o| {
            let Some(meta) = o.optimistic.as_ref() else {
                return false;
            };
            o.role == canonical.role
                && o.parent_id == canonical.parent_id
                && created.abs_diff(meta.timestamp) <= window_ms
        })
        .map(|o| (*o, MatchStrategy::Correlation))
}

/// Match a canonical part against its message's optimistic parts.
///
/// Priority: exact id, then tool parts by `callID`, then the single text
/// slot, then the reasoning slot (pinned by `reasoningId` when the
/// canonical part carries one).
pub fn match_part<'a>(
    canonical: &Part,
    optimistics: &[&'a Part],
) -> Option<(&'a Part, MatchStrategy)> {
    if let Some(exact) = optimistics.iter().find(|o| o.id == canonical.id).copied() {
        return Some((exact, MatchStrategy::ExactId));
    }
    let same_message = |o: &&&'a Part| o.message_id == canonical.message_id;

    match &canonical.body {
        body if body.is_tool() => optimistics
            .iter()
            .filter(same_message)
            .find(|o| o.body.is_tool() && o.body.call_id() == body.call_id())
            .map(|o| (*o, MatchStrategy::ToolCallId)),
        PartBody::Text { .. } => optimistics
            .iter()
            .filter(same_message)
            .find(|o| matches!(o.body, PartBody::Text { .. }))
            .map(|o| (*o, MatchStrategy::TextSlot)),
        PartBody::Reasoning { reasoning_id, .. } => optimistics
            .iter()
            .filter(same_message)
            .find(|o| match &o.body {
                PartBody::Reasoning { reasoning_id: opt_id, .. } => match reasoning_id {
                    Some(id) => opt_id.as_deref() == Some(id.as_str()),
                    None => true,
                },
                _ => false,
            })
            .map(|o| (*o, MatchStrategy::ReasoningSlot)),
        _ => None,
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::OptimisticMeta;

    fn message(id: &str, role: Role, parent: Option<&str>) -> Message {
        Message {
            id: id.into(),
            role,
            session_id: "s1".into(),
            parent_id: parent.map(str::to_string),
            time: None,
            model: None,
            provider: None,
            error: None,
            metadata: None,
            optimistic: None,
        }
    }

    fn optimistic(id: &str, role: Role, parent: Option<&str>, issued_ms: u64) -> Message {
        let mut m = message(id, role, parent);
        m.optimistic = Some(OptimisticMeta {
            source: "send_message".into(),
            correlation_key: message_key(role, parent, issued_ms),
            timestamp: issued_ms,
        });
        m
    }

    fn text_part(id: &str, message_id: &str) -> Part {
        Part::text(id, message_id, "s1", "hello")
    }

    fn tool_part(id: &str, message_id: &str, call_id: &str) -> Part {
        Part {
            id: id.into(),
            message_id: message_id.into(),
            session_id: "s1".into(),
            body: PartBody::ToolCall { call_id: call_id.into(), tool: None, args: None },
            metadata: None,
            optimistic: None,
        }
    }

    // ── Keys ──────────────────────────────────────────────────────────────────

    #[test]
    fn message_key_shape() {
        assert_eq!(message_key(Role::User, None, 123), "msg:user:no-parent:123");
        assert_eq!(message_key(Role::Assistant, Some("u1"), 9), "msg:assistant:u1:9");
    }

    #[test]
    fn part_key_shape() {
        assert_eq!(part_key("m1", "tool", Some("c1")), "part:m1:tool:c1");
        assert_eq!(part_key("m1", "text", None), "part:m1:text:default");
    }

    // ── Message matching ──────────────────────────────────────────────────────

    #[test]
    fn exact_id_beats_correlation() {
        let opt_same_id = optimistic("m1", Role::Assistant, Some("u1"), 1000);
        let opt_correlated = optimistic("opt-2", Role::Assistant, Some("u1"), 1000);
        let canonical = message("m1", Role::Assistant, Some("u1"));
        let found =
            match_message(&canonical, &[&opt_correlated, &opt_same_id], 1000, 30_000).unwrap();
        assert_eq!(found.0.id, "m1");
        assert_eq!(found.1, MatchStrategy::ExactId);
    }

    #[test]
    fn correlation_requires_role_parent_and_window() {
        let opt = optimistic("opt-1", Role::Assistant, Some("u1"), 1000);
        let mut canonical = message("m1", Role::Assistant, Some("u1"));
        canonical.time = Some(weft_protocol::MessageTime { created: 1500, completed: None });

        assert!(match_message(&canonical, &[&opt], 0, 30_000).is_some());

        let wrong_parent = message("m1", Role::Assistant, Some("u9"));
        assert!(match_message(&wrong_parent, &[&opt], 1500, 30_000).is_none());

        let wrong_role = message("m1", Role::User, Some("u1"));
        assert!(match_message(&wrong_role, &[&opt], 1500, 30_000).is_none());

        let mut too_late = message("m1", Role::Assistant, Some("u1"));
        too_late.time = Some(weft_protocol::MessageTime { created: 40_000, completed: None });
        assert!(match_message(&too_late, &[&opt], 0, 30_000).is_none());
    }

    #[test]
    fn canonical_without_time_uses_fallback() {
        let opt = optimistic("opt-1", Role::Assistant, None, 1000);
        let canonical = message("m1", Role::Assistant, None);
        assert!(match_message(&canonical, &[&opt], 1200, 30_000).is_some());
        assert!(match_message(&canonical, &[&opt], 90_000, 30_000).is_none());
    }

    // ── Part matching ─────────────────────────────────────────────────────────

    #[test]
    fn tool_parts_match_on_call_id() {
        let opt = tool_part("opt-t", "m1", "c1");
        let other = tool_part("opt-u", "m1", "c2");
        let canonical = tool_part("t1", "m1", "c1");
        let found = match_part(&canonical, &[&other, &opt]).unwrap();
        assert_eq!(found.0.id, "opt-t");
        assert_eq!(found.1, MatchStrategy::ToolCallId);
    }

    #[test]
    fn text_parts_match_by_message_slot() {
        let opt = text_part("opt-p", "m1");
        let elsewhere = text_part("opt-q", "m2");
        let canonical = text_part("p1", "m1");
        let found = match_part(&canonical, &[&elsewhere, &opt]).unwrap();
        assert_eq!(found.0.id, "opt-p");
        assert_eq!(found.1, MatchStrategy::TextSlot);
    }

    #[test]
    fn reasoning_id_must_agree_when_canonical_has_one() {
        let mut opt = text_part("opt-r", "m1");
        opt.body = PartBody::Reasoning { text: "...".into(), reasoning_id: Some("r1".into()), status: None };
        let mut canonical = text_part("p1", "m1");
        canonical.body =
            PartBody::Reasoning { text: "...".into(), reasoning_id: Some("r2".into()), status: None };
        assert!(match_part(&canonical, &[&opt]).is_none());

        canonical.body =
            PartBody::Reasoning { text: "...".into(), reasoning_id: Some("r1".into()), status: None };
        assert_eq!(match_part(&canonical, &[&opt]).unwrap().1, MatchStrategy::ReasoningSlot);
    }

    #[test]
    fn canonical_reasoning_without_id_matches_any_slot() {
        let mut opt = text_part("opt-r", "m1");
        opt.body = PartBody::Reasoning { text: "...".into(), reasoning_id: Some("r1".into()), status: None };
        let mut canonical = text_part("p1", "m1");
        canonical.body = PartBody::Reasoning { text: "...".into(), reasoning_id: None, status: None };
        assert!(match_part(&canonical, &[&opt]).is_some());
    }

    #[test]
    fn error_parts_never_slot_match() {
        let opt = text_part("opt-p", "m1");
        let mut canonical = text_part("p1", "m1");
        canonical.body = PartBody::Error { message: "boom".into() };
        assert!(match_part(&canonical, &[&opt]).is_none());
    }
}
