// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};

use weft_protocol::{Message, Part};

use crate::correlate::{match_message, match_part, MatchStrategy};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub total_canonical: usize,
    pub total_optimistic: usize,
    pub matched: usize,
    pub unmatched: usize,
    /// Unmatched optimistics older than the window. Counted here, removed
    /// by orphan cleanup on `idle` — never by reconciliation itself.
    pub stale: usize,
    pub by_strategy: HashMap<&'static str, usize>,
}

/// What the router must do to converge the store on the canonical set:
/// upsert these rows, remove those optimistic ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan<T> {
    pub to_upsert: Vec<T>,
    pub to_remove: Vec<String>,
    pub stats: ReconcileStats,
}

/// Plan the replacement of optimistic messages by their canonical twins.
///
/// Exact-id matches are updates to the same row and are never scheduled
/// for removal: removing them would cascade-delete their parts.
pub fn reconcile_messages(
    canonicals: &[Message],
    optimistics: &[&Message],
    now_ms: u64,
    window_ms: u64,
    fallback_created_ms: u64,
) -> ReconcilePlan<Message> {
    let mut plan = ReconcilePlan {
        to_upsert: Vec::with_capacity(canonicals.len()),
        to_remove: Vec::new(),
        stats: ReconcileStats {
            total_canonical: canonicals.len(),
            total_optimistic: optimistics.len(),
            ..Default::default()
        },
    };
    let mut matched_ids: HashSet<&str> = HashSet::new();

    for canonical in canonicals {
        let mut clean = canonical.clone();
        clean.optimistic = None;
        plan.to_upsert.push(clean);

        let available: Vec<&Message> =
            optimistics.iter().filter(|o| !matched_ids.contains(o.id.as_str())).copied().collect();
        if let Some((opt, strategy)) =
            match_message(canonical, &available, fallback_created_ms, window_ms)
        {
            matched_ids.insert(opt.id.as_str());
            plan.stats.matched += 1;
            *plan.stats.by_strategy.entry(strategy.name()).or_default() += 1;
            if strategy != MatchStrategy::ExactId {
                plan.to_remove.push(opt.id.clone());
            }
        }
    }

    for opt in optimistics {
        if matched_ids.contains(opt.id.as_str()) {
            continue;
        }
        plan.stats.unmatched += 1;
        let age = opt.optimistic.as_ref().map(|m| now_ms.saturating_sub(m.timestamp));
        if age.is_some_and(|a| a > window_ms) {
            plan.stats.stale += 1;
        }
    }
    plan
}

/// Plan the replacement of optimistic parts by their canonical twins.
pub fn reconcile_parts(
    canonicals: &[Part],
    optimistics: &[&Part],
    now_ms: u64,
    window_ms: u64,
) -> ReconcilePlan<Part> {
    let mut plan = ReconcilePlan {
        to_upsert: Vec::with_capacity(canonicals.len()),
        to_remove: Vec::new(),
        stats: ReconcileStats {
            total_canonical: canonicals.len(),
            total_optimistic: optimistics.len(),
            ..Default::default()
        },
    };
    let mut matched_ids: HashSet<&str> = HashSet::new();

    for canonical in canonicals {
        let mut clean = canonical.clone();
        clean.optimistic = None;
        plan.to_upsert.push(clean);

        let available: Vec<&Part> =
            optimistics.iter().filter(|o| !matched_ids.contains(o.id.as_str())).copied().collect();
        if let Some((opt, strategy)) = match_part(canonical, &available) {
            matched_ids.insert(opt.id.as_str());
            plan.stats.matched += 1;
            *plan.stats.by_strategy.entry(strategy.name()).or_default() += 1;
            if strategy != MatchStrategy::ExactId {
                plan.to_remove.push(opt.id.clone());
            }
        }
    }

    for opt in optimistics {
        if matched_ids.contains(opt.id.as_str()) {
            continue;
        }
        plan.stats.unmatched += 1;
        let age = opt.optimistic.as_ref().map(|m| now_ms.saturating_sub(m.timestamp));
        if age.is_some_and(|a| a > window_ms) {
            plan.stats.stale += 1;
        }
    }
    plan
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::{MessageTime, OptimisticMeta, PartBody, Role};

    fn canonical_message(id: &str, parent: Option<&str>, created: u64) -> Message {
        Message {
            id: id.into(),
            role: Role::Assistant,
            session_id: "s1".into(),
            parent_id: parent.map(str::to_string),
            time: Some(MessageTime { created, completed: None }),
            model: None,
            provider: None,
            error: None,
            metadata: None,
            optimistic: None,
        }
    }

    fn optimistic_message(id: &str, parent: Option<&str>, issued: u64) -> Message {
        let mut m = canonical_message(id, parent, issued);
        m.time = None;
        m.optimistic = Some(OptimisticMeta {
            source: "send_message".into(),
            correlation_key: format!("msg:assistant:{}:{issued}", parent.unwrap_or("no-parent")),
            timestamp: issued,
        });
        m
    }

    #[test]
    fn correlation_match_schedules_removal() {
        let canonical = canonical_message("m-canon", Some("u1"), 1500);
        let opt = optimistic_message("m-opt", Some("u1"), 1000);
        let plan = reconcile_messages(&[canonical], &[&opt], 2000, 30_000, 2000);
        assert_eq!(plan.to_upsert.len(), 1);
        assert!(plan.to_upsert[0].optimistic.is_none());
        assert_eq!(plan.to_remove, ["m-opt"]);
        assert_eq!(plan.stats.matched, 1);
        assert_eq!(plan.stats.by_strategy["correlation"], 1);
    }

    #[test]
    fn exact_id_match_is_not_removed() {
        let canonical = canonical_message("m1", Some("u1"), 1500);
        let opt = optimistic_message("m1", Some("u1"), 1000);
        let plan = reconcile_messages(&[canonical], &[&opt], 2000, 30_000, 2000);
        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.stats.by_strategy["exact-id"], 1);
    }

    #[test]
    fn stale_unmatched_optimistics_are_counted_not_removed() {
        let canonical = canonical_message("m1", Some("u1"), 100_000);
        let stale = optimistic_message("m-old", Some("u-other"), 1000);
        let plan = reconcile_messages(&[canonical], &[&stale], 100_000, 30_000, 100_000);
        assert_eq!(plan.stats.unmatched, 1);
        assert_eq!(plan.stats.stale, 1);
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn each_optimistic_matches_at_most_once() {
        let c1 = canonical_message("c1", Some("u1"), 1500);
        let c2 = canonical_message("c2", Some("u1"), 1600);
        let opt = optimistic_message("m-opt", Some("u1"), 1000);
        let plan = reconcile_messages(&[c1, c2], &[&opt], 2000, 30_000, 2000);
        assert_eq!(plan.stats.matched, 1);
        assert_eq!(plan.stats.unmatched, 0);
        assert_eq!(plan.to_remove.len(), 1);
    }

    #[test]
    fn part_plan_strips_optimistic_metadata() {
        let mut canonical = Part::text("p1", "m1", "s1", "final");
        canonical.optimistic = Some(OptimisticMeta {
            source: "stream".into(),
            correlation_key: "part:m1:text:default".into(),
            timestamp: 1,
        });
        let mut opt = Part::text("opt-p", "m1", "s1", "draft");
        opt.optimistic = canonical.optimistic.clone();

        let plan = reconcile_parts(&[canonical], &[&opt], 2000, 30_000);
        assert!(plan.to_upsert[0].optimistic.is_none());
        assert_eq!(plan.to_remove, ["opt-p"]);
        assert_eq!(plan.stats.by_strategy["text-slot"], 1);
    }

    #[test]
    fn reasoning_parts_reconcile_by_slot() {
        let mut canonical = Part::text("p1", "m1", "s1", "");
        canonical.body =
            PartBody::Reasoning { text: "done".into(), reasoning_id: None, status: None };
        let mut opt = Part::text("opt-r", "m1", "s1", "");
        opt.body = PartBody::Reasoning { text: "draft".into(), reasoning_id: None, status: None };
        opt.optimistic = Some(OptimisticMeta {
            source: "stream".into(),
            correlation_key: "part:m1:reasoning:default".into(),
            timestamp: 1,
        });
        let plan = reconcile_parts(&[canonical], &[&opt], 100, 30_000);
        assert_eq!(plan.to_remove, ["opt-r"]);
    }
}
