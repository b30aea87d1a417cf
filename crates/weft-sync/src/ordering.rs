// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use weft_protocol::ServerEvent;

#[derive(Debug, Clone, Copy)]
pub struct OrderingConfig {
    /// How long a queued gap event waits before being force-released.
    pub timeout: Duration,
    /// Per-session queue cap; overflow drops the lowest queued sequence.
    pub max_queue: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), max_queue: 1000 }
    }
}

#[derive(Debug)]
struct PendingEvent {
    event: ServerEvent,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct SessionOrdering {
    last_applied: Option<u64>,
    queue: BTreeMap<u64, PendingEvent>,
}

/// Aggregate counters across all sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderingStats {
    pub sessions: usize,
    pub queued: usize,
    pub released: u64,
    /// Events force-released by timeout.
    pub recovered: u64,
    /// Queued events discarded because a timeout release jumped past them.
    pub timeout_discarded: u64,
    /// Queued events dropped by the per-session queue cap.
    pub overflow_dropped: u64,
    /// Events dropped as stale (`sequence <= last_applied`).
    pub stale_dropped: u64,
}

/// Per-session view for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOrderingStats {
    pub last_applied: Option<u64>,
    pub queued: usize,
}

/// Per-session sequence-gap queue with deadline-driven release.
///
/// The buffer is synchronous; the caller supplies `now` and is responsible
/// for sleeping until [`next_deadline`](Self::next_deadline) and then
/// calling [`expire_due`](Self::expire_due). This keeps the gap/timeout
/// logic deterministic under test while the async pipeline drives it with
/// `tokio::time` in production.
#[derive(Debug, Default)]
pub struct OrderingBuffer {
    config: OrderingConfig,
    sessions: HashMap<String, SessionOrdering>,
    released: u64,
    recovered: u64,
    timeout_discarded: u64,
    overflow_dropped: u64,
    stale_dropped: u64,
}

impl OrderingBuffer {
    pub fn new(config: OrderingConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Admit one event, returning every event that became ready to apply.
    ///
    /// Events without a session scope bypass ordering entirely. The first
    /// event observed for a session wins regardless of its sequence value;
    /// sequences need not start at 1.
    pub fn admit(&mut self, event: ServerEvent, now: Instant) -> Vec<ServerEvent> {
        let Some(session_id) = event.session_scope().map(str::to_string) else {
            self.released += 1;
            return vec![event];
        };
        let state = self.sessions.entry(session_id.clone()).or_default();

        let Some(last) = state.last_applied else {
            state.last_applied = Some(event.sequence);
            self.released += 1;
            return vec![event];
        };

        if event.sequence <= last {
            self.stale_dropped += 1;
            debug!(session = %session_id, sequence = event.sequence, last, "stale event dropped");
            return vec![];
        }

        if event.sequence == last + 1 {
            let mut out = vec![event];
            let mut cursor = last + 1;
            while let Some(pending) = state.queue.remove(&(cursor + 1)) {
                cursor += 1;
                out.push(pending.event);
            }
            state.last_applied = Some(cursor);
            self.released += out.len() as u64;
            return out;
        }

        // Gap: park the event with its release deadline. A re-delivered
        // sequence keeps the original deadline rather than extending it.
        state
            .queue
            .entry(event.sequence)
            .or_insert_with(|| PendingEvent { event, deadline: now + self.config.timeout });
        if state.queue.len() > self.config.max_queue {
            if let Some((seq, _)) = state.queue.pop_first() {
                self.overflow_dropped += 1;
                warn!(session = %session_id, sequence = seq, "ordering queue overflow, dropped oldest");
            }
        }
        vec![]
    }

    /// The earliest pending release deadline across all sessions.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .flat_map(|s| s.queue.values().map(|p| p.deadline))
            .min()
    }

    /// Force-release every queued event whose deadline has passed, plus any
    /// contiguous successors, jumping `last_applied` forward. Queued
    /// sequences below a released one are discarded.
    ///
    /// This is a recovery path for permanently-lost server events; releases
    /// are surfaced in the stats and logged.
    pub fn expire_due(&mut self, now: Instant) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        for (session_id, state) in self.sessions.iter_mut() {
            loop {
                let Some((&seq, deadline)) =
                    state.queue.iter().map(|(s, p)| (s, p.deadline)).min_by_key(|(_, d)| *d)
                else {
                    break;
                };
                if deadline > now {
                    break;
                }

                let discarded: Vec<u64> = state.queue.range(..seq).map(|(s, _)| *s).collect();
                for s in &discarded {
                    state.queue.remove(s);
                }
                self.timeout_discarded += discarded.len() as u64;

                let pending = match state.queue.remove(&seq) {
                    Some(p) => p,
                    None => break,
                };
                warn!(
                    session = %session_id,
                    from = ?state.last_applied,
                    to = seq,
                    discarded = discarded.len(),
                    "ordering timeout, force-releasing sequence"
                );
                state.last_applied = Some(seq);
                self.recovered += 1;
                self.released += 1;
                out.push(pending.event);

                let mut cursor = seq;
                while let Some(next) = state.queue.remove(&(cursor + 1)) {
                    cursor += 1;
                    state.last_applied = Some(cursor);
                    self.released += 1;
                    out.push(next.event);
                }
            }
        }
        out
    }

    /// Forget all ordering state for one session, cancelling its pending
    /// release deadlines.
    pub fn clear_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn clear_all(&mut self) {
        self.sessions.clear();
    }

    pub fn session_stats(&self, session_id: &str) -> Option<SessionOrderingStats> {
        self.sessions.get(session_id).map(|s| SessionOrderingStats {
            last_applied: s.last_applied,
            queued: s.queue.len(),
        })
    }

    pub fn stats(&self) -> OrderingStats {
        OrderingStats {
            sessions: self.sessions.len(),
            queued: self.sessions.values().map(|s| s.queue.len()).sum(),
            released: self.released,
            recovered: self.recovered,
            timeout_discarded: self.timeout_discarded,
            overflow_dropped: self.overflow_dropped,
            stale_dropped: self.stale_dropped,
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
