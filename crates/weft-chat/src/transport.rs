// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use serde::Serialize;

/// Response header carrying the canonical session id (UUIDv7).
pub const SESSION_HEADER: &str = "X-Task-Session-ID";

pub type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<u8>>> + Send>>;

/// Body of a chat request. `session_id` is `None` for the first turn of a
/// new conversation; the server mints one and returns it in the
/// [`SESSION_HEADER`] response header.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub message: String,
}

/// Response head plus the synchronous event stream of the request body.
pub struct ChatResponse {
    pub session_header: Option<String>,
    pub body: ByteStream,
}

/// Seam to the chat HTTP endpoint. The core only ever sees the parsed
/// header and a byte stream, so tests script turns without a server.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse>;
}

/// Production transport: POSTs to `{base_url}/chat` and streams the body.
pub struct HttpChatTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open_chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        let resp = self
            .client
            .post(format!("{}/chat", self.base_url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .context("chat request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("chat endpoint error {status}: {text}");
        }

        let session_header = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body: ByteStream = Box::pin(
            resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()).map_err(Into::into)),
        );
        Ok(ChatResponse { session_header, body })
    }
}

/// A pre-scripted transport. Each call to `open_chat` pops the next
/// scripted turn from the front of the queue, so tests can specify exact
/// stream contents without network access.
pub struct ScriptedChatTransport {
    turns: Mutex<Vec<ScriptedTurn>>,
    /// The last `ChatRequest` seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
}

pub struct ScriptedTurn {
    pub session_header: Option<String>,
    pub chunks: Vec<anyhow::Result<Vec<u8>>>,
}

impl ScriptedChatTransport {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self { turns: Mutex::new(turns), last_request: Arc::new(Mutex::new(None)) }
    }

    /// Convenience: one turn whose body is the given payload lines, each
    /// wrapped in the `data: ...\n\n` framing, delivered one chunk per line.
    pub fn single_turn(session_header: Option<&str>, lines: &[serde_json::Value]) -> Self {
        let chunks = lines
            .iter()
            .map(|line| Ok(format!("data: {line}\n\n").into_bytes()))
            .collect();
        Self::new(vec![ScriptedTurn {
            session_header: session_header.map(str::to_string),
            chunks,
        }])
    }
}

#[async_trait]
impl ChatTransport for ScriptedChatTransport {
    async fn open_chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        *self.last_request.lock().expect("poisoned") = Some(request);
        let mut turns = self.turns.lock().expect("poisoned");
        if turns.is_empty() {
            bail!("no scripted turn left");
        }
        let turn = turns.remove(0);
        Ok(ChatResponse {
            session_header: turn.session_header,
            body: Box::pin(stream::iter(turn.chunks)),
        })
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_request_serializes_session_id_field() {
        let req = ChatRequest { session_id: Some("s1".into()), message: "hi".into() };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["sessionId"], "s1");
        assert_eq!(v["message"], "hi");

        let req = ChatRequest { session_id: None, message: "hi".into() };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v["sessionId"].is_null());
    }

    #[tokio::test]
    async fn scripted_transport_pops_turns_and_records_requests() {
        let transport = ScriptedChatTransport::single_turn(
            Some("018f6f00-0000-7000-8000-000000000000"),
            &[json!({"type": "finish", "finishReason": "stop"})],
        );
        let resp = transport
            .open_chat(ChatRequest { session_id: None, message: "hello".into() })
            .await
            .unwrap();
        assert!(resp.session_header.is_some());
        assert_eq!(
            transport.last_request.lock().unwrap().as_ref().unwrap().message,
            "hello"
        );
        // Queue exhausted.
        assert!(transport
            .open_chat(ChatRequest { session_id: None, message: "again".into() })
            .await
            .is_err());
    }
}
