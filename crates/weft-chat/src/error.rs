// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("a chat turn is already in flight")]
    Busy,

    #[error("invalid session id header: `{0}`")]
    InvalidSessionHeader(String),

    #[error("chat transport failed: {0}")]
    Transport(String),

    #[error("chat stream timed out")]
    Timeout,

    #[error("chat turn aborted")]
    Aborted,

    #[error("server reported a stream error: {0}")]
    Server(String),

    #[error("message `{0}` not found")]
    MessageNotFound(String),

    #[error("message `{0}` has no text to resend")]
    NothingToResend(String),
}
