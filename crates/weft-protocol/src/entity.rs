use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All age and correlation-window math in the workspace is done on these
/// millisecond integers; components that need determinism take the value as
/// an explicit parameter instead of calling this directly.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ─── Session ──────────────────────────────────────────────────────────────────

/// Lifecycle status of a session as reported by `session.status` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry {
        attempt: u32,
        message: String,
        /// Epoch-ms timestamp of the next retry attempt.
        next: u64,
    },
}

impl SessionStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// One conversation bound to a workspace directory; the unit of ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub directory: String,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            directory: directory.into(),
            status: SessionStatus::Idle,
        }
    }
}

// ─── Message ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MessageTime {
    /// Epoch-ms creation time.
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

/// Metadata carried by locally-fabricated entities awaiting server
/// confirmation. Absence means the entity is canonical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticMeta {
    /// Which subsystem fabricated the entity (e.g. `"send_message"`).
    pub source: String,
    /// Stable derived key used to match the later-arriving canonical twin.
    pub correlation_key: String,
    /// Epoch-ms issue time; entities older than the correlation window are
    /// stale and subject to orphan cleanup.
    pub timestamp: u64,
}

/// Wire shape of the `info` object in a `message.updated` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageInfo {
    pub id: String,
    pub role: Role,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<MessageTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A turn in a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<MessageTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<OptimisticMeta>,
}

impl Message {
    /// Build a canonical message from a `message.updated` `info` payload.
    /// The resolved session id is decided by the router, not the wire shape.
    pub fn from_info(info: MessageInfo, session_id: impl Into<String>) -> Self {
        Self {
            id: info.id,
            role: info.role,
            session_id: session_id.into(),
            parent_id: info.parent_id,
            time: info.time,
            model: info.model,
            provider: info.provider,
            error: info.error,
            metadata: info.metadata,
            optimistic: None,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic.is_some()
    }

    /// Creation timestamp used for correlation, with an explicit fallback for
    /// messages that arrived without a `time` block.
    pub fn created_at(&self, fallback_ms: u64) -> u64 {
        self.time.map(|t| t.created).unwrap_or(fallback_ms)
    }
}

// ─── Part ─────────────────────────────────────────────────────────────────────

/// Type-specific payload of a message part. The wire protocol is
/// string-tagged, and unknown tags are passed through untouched so newer
/// servers keep working against older clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartBody {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(rename = "reasoningId", default, skip_serializing_if = "Option::is_none")]
        reasoning_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    ToolCall {
        #[serde(rename = "callID")]
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
    ToolResult {
        #[serde(rename = "callID")]
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        message: String,
    },
    #[serde(untagged)]
    Other(Value),
}

impl PartBody {
    /// The wire tag of this part body. Unknown passthrough bodies report the
    /// embedded `type` string when present.
    pub fn kind(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::Tool { .. } => "tool",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Error { .. } => "error",
            Self::Other(v) => v.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Self::Tool { .. } | Self::ToolCall { .. })
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::Tool { call_id, .. }
            | Self::ToolCall { call_id, .. }
            | Self::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn reasoning_id(&self) -> Option<&str> {
        match self {
            Self::Reasoning { reasoning_id, .. } => reasoning_id.as_deref(),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Reasoning { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// A fragment of a message: text, reasoning, a tool call, a tool result, or
/// an error surfaced by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Part {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(flatten)]
    pub body: PartBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<OptimisticMeta>,
}

/// Metadata keys attached transiently by the router and stripped before
/// structural equality checks.
pub(crate) const TRANSIENT_METADATA_KEYS: [&str; 2] = ["__eventSequence", "__eventTimestamp"];

impl Part {
    pub fn text(id: impl Into<String>, message_id: impl Into<String>, session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message_id: message_id.into(),
            session_id: session_id.into(),
            body: PartBody::Text { text: text.into() },
            metadata: None,
            optimistic: None,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic.is_some()
    }

    /// Record the envelope sequence/timestamp on a copy of the metadata map.
    /// These keys are transport bookkeeping, not persisted semantics.
    pub fn with_transient_metadata(mut self, sequence: u64, timestamp: u64) -> Self {
        let meta = self.metadata.get_or_insert_with(serde_json::Map::new);
        meta.insert("__eventSequence".into(), sequence.into());
        meta.insert("__eventTimestamp".into(), timestamp.into());
        self
    }

    /// Copy with transient metadata keys removed; an emptied map normalises
    /// to `None` so stripped and never-annotated parts compare equal.
    pub fn without_transient_metadata(&self) -> Self {
        let mut part = self.clone();
        if let Some(meta) = part.metadata.as_mut() {
            for key in TRANSIENT_METADATA_KEYS {
                meta.remove(key);
            }
            if meta.is_empty() {
                part.metadata = None;
            }
        }
        part
    }
}

// ─── Ancillary requests ───────────────────────────────────────────────────────

/// Link from a permission or question back to the tool call that raised it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRef {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "callID")]
    pub call_id: String,
}

/// Wire payload of a `permission.asked` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionAsked {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub always: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

/// Wire payload of a `question.asked` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionAsked {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Part body tagging ─────────────────────────────────────────────────────

    #[test]
    fn part_round_trips_text_body() {
        let part = Part::text("p1", "m1", "s1", "hello");
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["messageID"], "m1");
        let back: Part = serde_json::from_value(v).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn tool_call_part_uses_kebab_tag_and_call_id() {
        let v = json!({
            "id": "p2", "messageID": "m1", "sessionID": "s1",
            "type": "tool-call", "callID": "c9", "tool": "bash",
            "args": {"cmd": "ls"}
        });
        let part: Part = serde_json::from_value(v).unwrap();
        assert_eq!(part.body.kind(), "tool-call");
        assert_eq!(part.body.call_id(), Some("c9"));
        assert!(part.body.is_tool());
    }

    #[test]
    fn unknown_part_type_passes_through() {
        let v = json!({
            "id": "p3", "messageID": "m1", "sessionID": "s1",
            "type": "citation", "url": "https://example.com"
        });
        let part: Part = serde_json::from_value(v.clone()).unwrap();
        assert_eq!(part.body.kind(), "citation");
        assert!(matches!(part.body, PartBody::Other(_)));
    }

    #[test]
    fn reasoning_part_exposes_reasoning_id() {
        let v = json!({
            "id": "p4", "messageID": "m1", "sessionID": "s1",
            "type": "reasoning", "text": "hmm", "reasoningId": "r7"
        });
        let part: Part = serde_json::from_value(v).unwrap();
        assert_eq!(part.body.reasoning_id(), Some("r7"));
    }

    // ── Transient metadata ────────────────────────────────────────────────────

    #[test]
    fn transient_metadata_strips_back_to_none() {
        let part = Part::text("p1", "m1", "s1", "x").with_transient_metadata(4, 99);
        let meta = part.metadata.as_ref().unwrap();
        assert_eq!(meta["__eventSequence"], 4);
        assert_eq!(meta["__eventTimestamp"], 99);
        let stripped = part.without_transient_metadata();
        assert!(stripped.metadata.is_none());
        assert_eq!(stripped, Part::text("p1", "m1", "s1", "x"));
    }

    #[test]
    fn strip_preserves_user_metadata_keys() {
        let mut part = Part::text("p1", "m1", "s1", "x");
        let mut meta = serde_json::Map::new();
        meta.insert("pinned".into(), json!(true));
        part.metadata = Some(meta);
        let stripped = part.with_transient_metadata(1, 1).without_transient_metadata();
        assert_eq!(stripped.metadata.as_ref().unwrap()["pinned"], true);
    }

    // ── Session status ────────────────────────────────────────────────────────

    #[test]
    fn session_status_retry_round_trips() {
        let status = SessionStatus::Retry { attempt: 2, message: "overloaded".into(), next: 1234 };
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["type"], "retry");
        assert_eq!(v["attempt"], 2);
        let back: SessionStatus = serde_json::from_value(v).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn message_created_at_falls_back() {
        let info: MessageInfo = serde_json::from_value(json!({"id": "m1", "role": "assistant"})).unwrap();
        let msg = Message::from_info(info, "s1");
        assert_eq!(msg.created_at(777), 777);
    }
}
