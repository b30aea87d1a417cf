// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;
use weft_protocol::{
    Message, MessageTime, OptimisticMeta, Part, PartBody, Role, StreamEvent, ThoughtStatus,
};
use weft_sync::{message_key, part_key, CORRELATION_WINDOW_MS};

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Correlation window; optimistics older than this are stale.
    pub window_ms: u64,
    /// Minimum age before `stop()` reaps an optimistic entity. Keeps a
    /// just-issued turn from being torn down by a racing stop.
    pub stop_reap_floor_ms: u64,
    /// Per-read timeout on the synchronous chat stream.
    pub stream_timeout: Duration,
    /// Directory recorded on sessions adopted from the response header.
    pub directory: String,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            window_ms: CORRELATION_WINDOW_MS,
            stop_reap_floor_ms: 250,
            stream_timeout: Duration::from_secs(30),
            directory: "default".into(),
        }
    }
}

/// Shape check for the `X-Task-Session-ID` response header (UUIDv7).
pub fn is_valid_session_header(value: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-7[0-9a-f]{3}-[89ab][0-9a-f]{4}-[0-9a-f]{12}$")
            .expect("static regex")
    });
    re.is_match(value)
}

/// What the chat core should do with one parsed stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    /// Upsert this optimistic part (coalesced accumulation included).
    Upsert(Part),
    /// The server finished the turn.
    Finish { reason: String },
    /// The server reported a stream error.
    Fail { error: String },
    /// Nothing to do (e.g. a result for an unknown tool call).
    Skip,
}

#[derive(Debug)]
struct ToolCallState {
    part_id: String,
    tool: String,
    args: Value,
}

/// Per-turn optimistic state machine.
///
/// Fabricates the optimistic user message and text part for a turn, then
/// folds the synchronous stream's deltas into optimistic assistant parts:
/// repeated text/thought deltas for one stream id coalesce into a single
/// accumulated upsert, and tool results patch the matching tool part. The
/// stream's `id` field is the assistant message id, so assistant parts
/// defer in the pipeline until the canonical `message.updated` lands.
#[derive(Debug)]
pub struct TurnIssuer {
    session_id: String,
    placeholder: bool,
    user_message_id: String,
    issued_message_ids: Vec<String>,
    issued_part_ids: Vec<String>,
    text_accum: HashMap<String, String>,
    thought_accum: HashMap<String, String>,
    tool_calls: HashMap<String, ToolCallState>,
}

impl TurnIssuer {
    /// Mint the optimistic user message and its text part for a new turn.
    ///
    /// With no current session, the entities are parked under a locally
    /// minted placeholder session until the canonical id arrives in the
    /// response header.
    pub fn begin(
        session: Option<String>,
        text: &str,
        retry_of: Option<String>,
        now_ms: u64,
    ) -> (Self, Message, Part) {
        let (session_id, placeholder) = match session {
            Some(id) => (id, false),
            None => (format!("pending-{}", Uuid::new_v4()), true),
        };
        let user_message_id = format!("optimistic-{}", Uuid::new_v4());
        let part_id = format!("{user_message_id}-text");

        let message = Message {
            id: user_message_id.clone(),
            role: Role::User,
            session_id: session_id.clone(),
            parent_id: None,
            time: Some(MessageTime { created: now_ms, completed: None }),
            model: None,
            provider: None,
            error: None,
            metadata: retry_of.map(|id| json!({ "retryOfAssistantMessageId": id })),
            optimistic: Some(OptimisticMeta {
                source: "send_message".into(),
                correlation_key: message_key(Role::User, None, now_ms),
                timestamp: now_ms,
            }),
        };
        let part = Part {
            id: part_id.clone(),
            message_id: user_message_id.clone(),
            session_id: session_id.clone(),
            body: PartBody::Text { text: text.into() },
            metadata: None,
            optimistic: Some(OptimisticMeta {
                source: "send_message".into(),
                correlation_key: part_key(&user_message_id, "text", None),
                timestamp: now_ms,
            }),
        };

        let issuer = Self {
            session_id,
            placeholder,
            user_message_id: user_message_id.clone(),
            issued_message_ids: vec![user_message_id],
            issued_part_ids: vec![part_id],
            text_accum: HashMap::new(),
            thought_accum: HashMap::new(),
            tool_calls: HashMap::new(),
        };
        (issuer, message, part)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn issued_message_ids(&self) -> &[String] {
        &self.issued_message_ids
    }

    pub fn issued_part_ids(&self) -> &[String] {
        &self.issued_part_ids
    }

    /// Switch the turn to the canonical session from the response header.
    /// Returns the retired placeholder id on the first adoption.
    pub fn adopt_session(&mut self, canonical: &str) -> Option<String> {
        if !self.placeholder {
            return None;
        }
        self.placeholder = false;
        Some(std::mem::replace(&mut self.session_id, canonical.to_string()))
    }

    /// Fold one stream event into the turn's optimistic state.
    pub fn on_stream_event(&mut self, event: StreamEvent, now_ms: u64) -> StreamAction {
        match event {
            StreamEvent::TextDelta { id, delta } => {
                let part_id = format!("{id}-text");
                let accum = self.text_accum.entry(part_id.clone()).or_default();
                accum.push_str(&delta);
                let body = PartBody::Text { text: accum.clone() };
                StreamAction::Upsert(self.assistant_part(part_id, &id, body, "text", None, now_ms))
            }
            StreamEvent::DataThought { id, data } => {
                let part_id = format!("{id}-thought");
                let accum = self.thought_accum.entry(part_id.clone()).or_default();
                accum.push_str(&data.text);
                let body = PartBody::Reasoning {
                    text: accum.clone(),
                    reasoning_id: Some(id.clone()),
                    status: Some(
                        match data.status {
                            ThoughtStatus::Thinking => "thinking",
                            ThoughtStatus::Complete => "complete",
                        }
                        .into(),
                    ),
                };
                let discriminator = id.clone();
                StreamAction::Upsert(self.assistant_part(
                    part_id,
                    &id,
                    body,
                    "reasoning",
                    Some(&discriminator),
                    now_ms,
                ))
            }
            StreamEvent::DataToolCall { id, data } => {
                let part_id = format!("{id}-tool");
                self.tool_calls.insert(
                    data.tool_call_id.clone(),
                    ToolCallState {
                        part_id: part_id.clone(),
                        tool: data.tool_name.clone(),
                        args: data.args.clone(),
                    },
                );
                let body = PartBody::ToolCall {
                    call_id: data.tool_call_id.clone(),
                    tool: Some(data.tool_name),
                    args: Some(data.args),
                };
                let discriminator = data.tool_call_id;
                StreamAction::Upsert(self.assistant_part(
                    part_id,
                    &id,
                    body,
                    "tool-call",
                    Some(&discriminator),
                    now_ms,
                ))
            }
            StreamEvent::DataToolResult { id, data } => {
                let Some(call) = self.tool_calls.get(&data.tool_call_id) else {
                    debug!(call_id = %data.tool_call_id, "result for unknown tool call");
                    return StreamAction::Skip;
                };
                let part_id = call.part_id.clone();
                let body = PartBody::Tool {
                    call_id: data.tool_call_id.clone(),
                    tool: Some(call.tool.clone()),
                    args: Some(call.args.clone()),
                    result: Some(data.result),
                };
                let discriminator = data.tool_call_id;
                StreamAction::Upsert(self.assistant_part(
                    part_id,
                    &id,
                    body,
                    "tool",
                    Some(&discriminator),
                    now_ms,
                ))
            }
            StreamEvent::Finish { finish_reason } => StreamAction::Finish { reason: finish_reason },
            StreamEvent::Error { error } => StreamAction::Fail { error },
        }
    }

    fn assistant_part(
        &mut self,
        part_id: String,
        message_id: &str,
        body: PartBody,
        kind: &str,
        discriminator: Option<&str>,
        now_ms: u64,
    ) -> Part {
        if !self.issued_part_ids.iter().any(|p| p == &part_id) {
            self.issued_part_ids.push(part_id.clone());
        }
        Part {
            id: part_id,
            message_id: message_id.to_string(),
            session_id: self.session_id.clone(),
            body,
            metadata: None,
            optimistic: Some(OptimisticMeta {
                source: "send_message".into(),
                correlation_key: part_key(message_id, kind, discriminator),
                timestamp: now_ms,
            }),
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
