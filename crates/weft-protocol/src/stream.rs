// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One parsed payload line of the synchronous in-request chat stream.
///
/// The `id` field on delta events is the server-assigned assistant message
/// id for the turn; derived part ids (`{id}-text`, `{id}-thought`,
/// `{id}-tool`) hang off it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    TextDelta {
        id: String,
        delta: String,
    },
    DataThought {
        id: String,
        data: ThoughtData,
    },
    DataToolCall {
        id: String,
        data: ToolCallData,
    },
    DataToolResult {
        id: String,
        data: ToolResultData,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThoughtData {
    pub text: String,
    pub status: ThoughtStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThoughtStatus {
    Thinking,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallData {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultData {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(default)]
    pub result: Value,
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
