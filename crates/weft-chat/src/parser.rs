// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::debug;
use weft_protocol::StreamEvent;

use crate::error::ChatError;
use crate::transport::ByteStream;

/// Reader for the synchronous chat stream: line-oriented UTF-8, each
/// payload line prefixed by `data: `.
///
/// Lines can be split across TCP chunks, so a remainder buffer is carried
/// forward and only complete lines (terminated by `\n`) are parsed.
/// Malformed JSON lines are skipped. Every read honours the configured
/// timeout and the external cancel channel.
pub struct ChatStreamReader {
    body: ByteStream,
    buf: String,
    timeout: Duration,
}

impl ChatStreamReader {
    pub fn new(body: ByteStream, timeout: Duration) -> Self {
        Self { body, buf: String::new(), timeout }
    }

    /// Next parsed stream event, or `None` when the body ends.
    ///
    /// Cancellation (a send on the paired sender, or dropping it) resolves
    /// to [`ChatError::Aborted`] at the next suspension point.
    pub async fn next_event(
        &mut self,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<Option<StreamEvent>, ChatError> {
        loop {
            while let Some(pos) = self.buf.find('\n') {
                let line = self.buf[..pos].trim_end_matches('\r').to_string();
                self.buf.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                match serde_json::from_str::<StreamEvent>(data.trim()) {
                    Ok(event) => return Ok(Some(event)),
                    Err(err) => {
                        debug!(error = %err, "skipping malformed stream line");
                    }
                }
            }

            let chunk = tokio::select! {
                // Cancellation wins over a simultaneously-ready chunk.
                biased;
                _ = &mut *cancel => return Err(ChatError::Aborted),
                chunk = tokio::time::timeout(self.timeout, self.body.next()) => chunk,
            };
            match chunk {
                Err(_) => return Err(ChatError::Timeout),
                Ok(None) => return Ok(None),
                Ok(Some(Err(err))) => return Err(ChatError::Transport(err.to_string())),
                Ok(Some(Ok(bytes))) => self.buf.push_str(&String::from_utf8_lossy(&bytes)),
            }
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
