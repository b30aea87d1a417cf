// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod entity;
mod envelope;
mod stream;
mod validate;

pub use entity::{
    now_ms, Message, MessageInfo, MessageTime, OptimisticMeta, Part, PartBody, PermissionAsked,
    PermissionReply, QuestionAsked, Role, Session, SessionStatus, ToolRef,
};
pub use envelope::{EventPayload, ServerEvent};
pub use stream::{StreamEvent, ThoughtData, ThoughtStatus, ToolCallData, ToolResultData};
pub use validate::{parse_event, validate, ValidationError};
