// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{
    MessageInfo, Part, PermissionAsked, PermissionReply, QuestionAsked, SessionStatus,
};
use crate::validate::ValidationError;

/// One server-sent event as emitted by the `StreamSource` collaborator.
///
/// The envelope is wire-faithful: `properties` stays an untyped JSON object
/// and is parsed into an [`EventPayload`] on demand, so unknown event kinds
/// travel through the pipeline without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: Value,
    #[serde(rename = "eventId")]
    pub event_id: String,
    /// Per-session monotonic counter assigned by the server.
    pub sequence: u64,
    /// Epoch-ms emission time.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ServerEvent {
    /// The session this event is ordered under, resolved from the envelope
    /// field or from the conventional property locations. Events without a
    /// session bypass per-session ordering entirely.
    pub fn session_scope(&self) -> Option<&str> {
        if let Some(id) = self.session_id.as_deref() {
            return Some(id);
        }
        let props = &self.properties;
        props["sessionID"]
            .as_str()
            .or_else(|| props["info"]["sessionID"].as_str())
            .or_else(|| props["part"]["sessionID"].as_str())
    }

    /// Parse `properties` into the typed payload for this event kind.
    ///
    /// Unknown kinds yield [`EventPayload::Unknown`] rather than an error;
    /// known kinds with malformed properties fail with
    /// [`ValidationError::BadProperties`].
    pub fn payload(&self) -> Result<EventPayload, ValidationError> {
        let props = self.properties.clone();
        let parse_err = |e: serde_json::Error| ValidationError::BadProperties {
            kind: self.kind.clone(),
            reason: e.to_string(),
        };
        let payload = match self.kind.as_str() {
            "server.connected" => EventPayload::ServerConnected,
            "server.heartbeat" => EventPayload::ServerHeartbeat,
            "session.created" => {
                let p: SessionCreatedProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::SessionCreated { session_id: p.session_id, directory: p.directory }
            }
            "session.updated" => {
                let p: SessionUpdatedProps = serde_json::from_value(props).map_err(parse_err)?;
                let directory = p.directory.or_else(|| {
                    p.info
                        .as_ref()
                        .and_then(|i| i["directory"].as_str())
                        .map(str::to_string)
                });
                EventPayload::SessionUpdated { session_id: p.session_id, status: p.status, directory }
            }
            "session.status" => {
                let p: SessionStatusProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::SessionStatus { session_id: p.session_id, status: p.status }
            }
            "message.updated" => {
                let p: MessageUpdatedProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::MessageUpdated { info: p.info, session_id: p.session_id }
            }
            "message.part.updated" => {
                let p: PartUpdatedProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::PartUpdated { part: p.part }
            }
            "message.part.removed" => {
                let p: PartRemovedProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::PartRemoved {
                    part_id: p.part_id,
                    message_id: p.message_id,
                    session_id: p.session_id,
                }
            }
            "permission.asked" => {
                let p: PermissionAsked = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::PermissionAsked(p)
            }
            "permission.replied" => {
                let p: PermissionRepliedProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::PermissionReplied {
                    session_id: p.session_id,
                    request_id: p.request_id,
                    reply: p.reply,
                }
            }
            "question.asked" => {
                let p: QuestionAsked = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::QuestionAsked(p)
            }
            "question.replied" => {
                let p: QuestionRepliedProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::QuestionReplied {
                    session_id: p.session_id,
                    request_id: p.request_id,
                    reply: p.reply,
                }
            }
            "question.rejected" => {
                let p: QuestionRejectedProps = serde_json::from_value(props).map_err(parse_err)?;
                EventPayload::QuestionRejected {
                    session_id: p.session_id,
                    request_id: p.request_id,
                    reason: p.reason,
                }
            }
            _ => EventPayload::Unknown,
        };
        Ok(payload)
    }
}

/// Typed view of an event's `properties`, keyed on the envelope `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ServerConnected,
    ServerHeartbeat,
    SessionCreated { session_id: String, directory: String },
    SessionUpdated { session_id: String, status: Option<SessionStatus>, directory: Option<String> },
    SessionStatus { session_id: String, status: SessionStatus },
    MessageUpdated { info: MessageInfo, session_id: Option<String> },
    PartUpdated { part: Part },
    PartRemoved { part_id: String, message_id: String, session_id: String },
    PermissionAsked(PermissionAsked),
    PermissionReplied { session_id: String, request_id: String, reply: PermissionReply },
    QuestionAsked(QuestionAsked),
    QuestionReplied { session_id: String, request_id: String, reply: String },
    QuestionRejected { session_id: String, request_id: String, reason: Option<String> },
    Unknown,
}

// ─── Per-kind property shapes ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionCreatedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    directory: String,
}

#[derive(Deserialize)]
struct SessionUpdatedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    status: Option<SessionStatus>,
    #[serde(default)]
    directory: Option<String>,
    /// Opaque session info blob; only `directory` is read from it.
    #[serde(default)]
    info: Option<Value>,
}

#[derive(Deserialize)]
struct SessionStatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: SessionStatus,
}

#[derive(Deserialize)]
struct MessageUpdatedProps {
    info: MessageInfo,
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: Part,
}

#[derive(Deserialize)]
struct PartRemovedProps {
    #[serde(rename = "partID")]
    part_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct PermissionRepliedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID")]
    request_id: String,
    reply: PermissionReply,
}

#[derive(Deserialize)]
struct QuestionRepliedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID")]
    request_id: String,
    reply: String,
}

#[derive(Deserialize)]
struct QuestionRejectedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID")]
    request_id: String,
    #[serde(default)]
    reason: Option<String>,
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: &str, properties: Value) -> ServerEvent {
        ServerEvent {
            kind: kind.into(),
            properties,
            event_id: "e1".into(),
            sequence: 1,
            timestamp: 1000,
            directory: None,
            session_id: None,
        }
    }

    // ── Session scope resolution ──────────────────────────────────────────────

    #[test]
    fn session_scope_prefers_envelope_field() {
        let mut ev = event("session.status", json!({"sessionID": "props"}));
        ev.session_id = Some("envelope".into());
        assert_eq!(ev.session_scope(), Some("envelope"));
    }

    #[test]
    fn session_scope_reads_info_and_part() {
        let ev = event("message.updated", json!({"info": {"sessionID": "s1"}}));
        assert_eq!(ev.session_scope(), Some("s1"));
        let ev = event("message.part.updated", json!({"part": {"sessionID": "s2"}}));
        assert_eq!(ev.session_scope(), Some("s2"));
    }

    #[test]
    fn session_scope_absent_for_server_events() {
        assert_eq!(event("server.heartbeat", json!({})).session_scope(), None);
    }

    // ── Payload parsing ───────────────────────────────────────────────────────

    #[test]
    fn session_created_payload_parses() {
        let ev = event("session.created", json!({"sessionID": "s1", "directory": "/repo"}));
        let payload = ev.payload().unwrap();
        assert_eq!(
            payload,
            EventPayload::SessionCreated { session_id: "s1".into(), directory: "/repo".into() }
        );
    }

    #[test]
    fn session_created_missing_directory_is_rejected() {
        let ev = event("session.created", json!({"sessionID": "s1"}));
        assert!(ev.payload().is_err());
    }

    #[test]
    fn unknown_kind_parses_to_unknown() {
        let ev = event("telemetry.flush", json!({"whatever": 1}));
        assert_eq!(ev.payload().unwrap(), EventPayload::Unknown);
    }

    #[test]
    fn permission_replied_reply_values() {
        for (wire, expected) in [
            ("once", PermissionReply::Once),
            ("always", PermissionReply::Always),
            ("reject", PermissionReply::Reject),
        ] {
            let ev = event(
                "permission.replied",
                json!({"sessionID": "s1", "requestID": "r1", "reply": wire}),
            );
            match ev.payload().unwrap() {
                EventPayload::PermissionReplied { reply, .. } => assert_eq!(reply, expected),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn part_removed_payload_parses() {
        let ev = event(
            "message.part.removed",
            json!({"partID": "p1", "messageID": "m1", "sessionID": "s1"}),
        );
        assert_eq!(
            ev.payload().unwrap(),
            EventPayload::PartRemoved {
                part_id: "p1".into(),
                message_id: "m1".into(),
                session_id: "s1".into()
            }
        );
    }
}
