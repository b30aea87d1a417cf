// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;
use thiserror::Error;

use crate::envelope::ServerEvent;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing or empty envelope field `{0}`")]
    MissingField(&'static str),

    #[error("envelope field `{0}` has the wrong type")]
    WrongType(&'static str),

    #[error("`{0}` must be a finite non-negative integer")]
    NotAnInteger(&'static str),

    #[error("event `{kind}` has malformed properties: {reason}")]
    BadProperties { kind: String, reason: String },
}

/// Structural validation of an incoming event.
///
/// Envelope fields are checked first, then the `type`-specific required
/// property fields via the typed payload parse. Unknown event kinds pass:
/// forward compatibility is the router's concern, not the validator's.
pub fn validate(event: &ServerEvent) -> Result<(), ValidationError> {
    if event.kind.is_empty() {
        return Err(ValidationError::MissingField("type"));
    }
    if event.event_id.is_empty() {
        return Err(ValidationError::MissingField("eventId"));
    }
    if !event.properties.is_object() {
        return Err(ValidationError::WrongType("properties"));
    }
    event.payload().map(|_| ())
}

/// Parse a raw JSON value into a [`ServerEvent`], enforcing the envelope
/// contract on the way in.
///
/// This is the entry point for callers that receive untyped SSE payloads;
/// `sequence` and `timestamp` are checked as unsigned integers here because
/// a float or negative number would otherwise be silently truncated.
pub fn parse_event(value: &Value) -> Result<ServerEvent, ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::WrongType("event"))?;

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingField("type"))?;
    let event_id = obj
        .get("eventId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingField("eventId"))?;
    let sequence = integer_field(obj.get("sequence"), "sequence")?;
    let timestamp = integer_field(obj.get("timestamp"), "timestamp")?;
    let properties = obj.get("properties").cloned().ok_or(ValidationError::MissingField("properties"))?;
    if !properties.is_object() {
        return Err(ValidationError::WrongType("properties"));
    }

    let event = ServerEvent {
        kind: kind.to_string(),
        properties,
        event_id: event_id.to_string(),
        sequence,
        timestamp,
        directory: obj.get("directory").and_then(Value::as_str).map(str::to_string),
        session_id: obj.get("sessionID").and_then(Value::as_str).map(str::to_string),
    };
    validate(&event)?;
    Ok(event)
}

fn integer_field(value: Option<&Value>, name: &'static str) -> Result<u64, ValidationError> {
    let v = value.ok_or(ValidationError::MissingField(name))?;
    v.as_u64().ok_or(ValidationError::NotAnInteger(name))
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(kind: &str, properties: Value) -> Value {
        json!({
            "type": kind,
            "properties": properties,
            "eventId": "e1",
            "sequence": 3,
            "timestamp": 1700000000000u64,
        })
    }

    #[test]
    fn well_formed_event_parses() {
        let ev = parse_event(&raw("session.created", json!({"sessionID": "s1", "directory": "/r"}))).unwrap();
        assert_eq!(ev.kind, "session.created");
        assert_eq!(ev.sequence, 3);
    }

    #[test]
    fn missing_event_id_is_rejected() {
        let mut v = raw("server.heartbeat", json!({}));
        v.as_object_mut().unwrap().remove("eventId");
        assert_eq!(parse_event(&v), Err(ValidationError::MissingField("eventId")));
    }

    #[test]
    fn negative_sequence_is_rejected() {
        let mut v = raw("server.heartbeat", json!({}));
        v["sequence"] = json!(-1);
        assert_eq!(parse_event(&v), Err(ValidationError::NotAnInteger("sequence")));
    }

    #[test]
    fn float_timestamp_is_rejected() {
        let mut v = raw("server.heartbeat", json!({}));
        v["timestamp"] = json!(12.5);
        assert_eq!(parse_event(&v), Err(ValidationError::NotAnInteger("timestamp")));
    }

    #[test]
    fn non_object_properties_is_rejected() {
        let mut v = raw("server.heartbeat", json!({}));
        v["properties"] = json!("nope");
        assert_eq!(parse_event(&v), Err(ValidationError::WrongType("properties")));
    }

    #[test]
    fn known_kind_with_bad_properties_is_rejected() {
        // message.updated requires an `info` object with id + role.
        let v = raw("message.updated", json!({"info": {"id": "m1"}}));
        assert!(matches!(parse_event(&v), Err(ValidationError::BadProperties { .. })));
    }

    #[test]
    fn unknown_kind_passes_validation() {
        let v = raw("metrics.sampled", json!({"anything": [1, 2, 3]}));
        assert!(parse_event(&v).is_ok());
    }

    #[test]
    fn envelope_session_id_is_captured() {
        let mut v = raw("server.heartbeat", json!({}));
        v["sessionID"] = json!("s9");
        assert_eq!(parse_event(&v).unwrap().session_id.as_deref(), Some("s9"));
    }
}
