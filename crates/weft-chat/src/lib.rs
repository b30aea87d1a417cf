// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod core;
mod error;
mod issuer;
mod parser;
mod transport;

pub use crate::core::{ChatCore, CoreConfig};
pub use error::ChatError;
pub use issuer::{is_valid_session_header, IssuerConfig, StreamAction, TurnIssuer};
pub use parser::ChatStreamReader;
pub use transport::{
    ByteStream, ChatRequest, ChatResponse, ChatTransport, HttpChatTransport,
    ScriptedChatTransport, ScriptedTurn, SESSION_HEADER,
};
