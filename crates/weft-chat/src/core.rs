// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;
use weft_protocol::{now_ms, PartBody, Role, ServerEvent};
use weft_store::{
    PermissionRecord, QuestionRecord, StoreView, Stores, StreamingStatus,
};
use weft_sync::{
    DedupStats, EventPipeline, OrderingStats, PipelineConfig, PipelineStats,
    SessionOrderingStats,
};

use crate::error::ChatError;
use crate::issuer::{is_valid_session_header, IssuerConfig, StreamAction, TurnIssuer};
use crate::parser::ChatStreamReader;
use crate::transport::{ChatRequest, ChatTransport};

#[derive(Debug, Default)]
pub struct CoreConfig {
    pub pipeline: PipelineConfig,
    pub issuer: IssuerConfig,
}

/// The reconciliation core as exposed to the UI layer.
///
/// Owns the whole ingest pipeline plus the optimistic issuer, and runs
/// single-threaded: every operation takes `&mut self`, and the only yields
/// are the chat transport's I/O points. `stop()` is the post-abort half of
/// cancellation; the in-flight half is the oneshot sender paired with the
/// receiver given to [`send_message_with_cancel`](Self::send_message_with_cancel).
pub struct ChatCore<V: StoreView> {
    config: IssuerConfig,
    pipeline: EventPipeline,
    transport: Arc<dyn ChatTransport>,
    view: V,
    status: StreamingStatus,
    session_id: Option<String>,
}

impl<V: StoreView> ChatCore<V> {
    pub fn new(config: CoreConfig, transport: Arc<dyn ChatTransport>, view: V) -> Self {
        Self {
            config: config.issuer,
            pipeline: EventPipeline::new(config.pipeline),
            transport,
            view,
            status: StreamingStatus::Idle,
            session_id: None,
        }
    }

    // ── Read access ───────────────────────────────────────────────────────────

    pub fn stores(&self) -> &Stores {
        self.pipeline.stores()
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn streaming_status(&self) -> StreamingStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Pending permission prompts for a session, oldest ask first.
    pub fn pending_permissions(&self, session_id: &str) -> Vec<&PermissionRecord> {
        self.pipeline.stores().requests.pending_permissions(session_id)
    }

    pub fn pending_questions(&self, session_id: &str) -> Vec<&QuestionRecord> {
        self.pipeline.stores().requests.pending_questions(session_id)
    }

    // ── Event ingest ──────────────────────────────────────────────────────────

    /// Feed one server-sent event through the pipeline. Returns the events
    /// admitted past the ordering stage in this call.
    pub fn apply_event(&mut self, event: ServerEvent) -> Vec<ServerEvent> {
        self.pipeline.apply_event(event, &mut self.view)
    }

    /// Deterministic variant for tests and replay tooling.
    pub fn apply_event_at(&mut self, event: ServerEvent, now: Instant, now_ms: u64) -> Vec<ServerEvent> {
        self.pipeline.apply_event_at(event, now, now_ms, &mut self.view)
    }

    /// Process any elapsed ordering/coalescer deadlines.
    pub fn pump(&mut self) {
        self.pipeline.pump(&mut self.view);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pipeline.next_deadline()
    }

    /// Drive pending timers to completion; `select!` this against the next
    /// incoming SSE event in the embedding loop.
    pub async fn run_timers(&mut self) {
        self.pipeline.run_until_idle(&mut self.view).await;
    }

    // ── Chat turns ────────────────────────────────────────────────────────────

    /// Send a user turn without external cancellation.
    pub async fn send_message(&mut self, text: &str) -> Result<(), ChatError> {
        // The sender must outlive the call: dropping it would read as abort.
        let (_keepalive, cancel) = oneshot::channel();
        self.send_message_with_cancel(text, cancel).await
    }

    /// Send a user turn. A send on (or drop of) the paired sender aborts
    /// the stream at the next suspension point.
    pub async fn send_message_with_cancel(
        &mut self,
        text: &str,
        cancel: oneshot::Receiver<()>,
    ) -> Result<(), ChatError> {
        self.run_turn(text, None, cancel).await
    }

    /// Re-send the text of a user message; for an assistant message, the
    /// parent user message is re-sent and the assistant id is recorded as
    /// `retryOfAssistantMessageId` on the new optimistic turn.
    pub async fn retry(&mut self, message_id: &str) -> Result<(), ChatError> {
        let (_keepalive, cancel) = oneshot::channel();
        self.retry_with_cancel(message_id, cancel).await
    }

    pub async fn retry_with_cancel(
        &mut self,
        message_id: &str,
        cancel: oneshot::Receiver<()>,
    ) -> Result<(), ChatError> {
        let (text, retry_of) = self.resolve_retry(message_id)?;
        self.run_turn(&text, retry_of, cancel).await
    }

    /// Post-abort cleanup: settle the streaming state and synchronously
    /// reap optimistic leftovers older than the configured floor.
    pub fn stop(&mut self) {
        self.set_status(StreamingStatus::Idle);
        if let Some(session) = self.session_id.clone() {
            self.pipeline.reap_stale_optimistics(
                &session,
                now_ms(),
                self.config.stop_reap_floor_ms,
                &mut self.view,
            );
        }
    }

    async fn run_turn(
        &mut self,
        text: &str,
        retry_of: Option<String>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<(), ChatError> {
        if self.status.is_active() {
            return Err(ChatError::Busy);
        }
        self.set_status(StreamingStatus::Connecting);

        let (mut turn, message, part) =
            TurnIssuer::begin(self.session_id.clone(), text, retry_of, now_ms());
        if let Err(err) = self
            .pipeline
            .issue_message(message, &mut self.view)
            .and_then(|()| self.pipeline.issue_part(part, &mut self.view))
        {
            self.fail_turn(&turn);
            return Err(ChatError::Transport(err.to_string()));
        }

        let request =
            ChatRequest { session_id: self.session_id.clone(), message: text.to_string() };
        let transport = Arc::clone(&self.transport);
        let opened = tokio::select! {
            // Cancellation wins over a simultaneously-ready response.
            biased;
            _ = &mut cancel => None,
            response = transport.open_chat(request) => Some(response),
        };
        let response = match opened {
            None => {
                self.abort_turn(&turn);
                return Err(ChatError::Aborted);
            }
            Some(Err(err)) => {
                self.fail_turn(&turn);
                return Err(ChatError::Transport(err.to_string()));
            }
            Some(Ok(response)) => response,
        };

        if let Some(header) = response.session_header.as_deref() {
            if !is_valid_session_header(header) {
                self.fail_turn(&turn);
                return Err(ChatError::InvalidSessionHeader(header.to_string()));
            }
            if self.session_id.is_none() {
                self.pipeline.adopt_session(header, &self.config.directory, &mut self.view);
                if turn.adopt_session(header).is_some() {
                    // Migration retires the placeholder session once empty;
                    // this must land before any canonical event can race it.
                    if let Err(err) = self.pipeline.migrate_message_session(
                        turn.user_message_id(),
                        header,
                        &mut self.view,
                    ) {
                        warn!(error = %err, "optimistic session migration failed");
                    }
                }
                self.session_id = Some(header.to_string());
            }
        }

        self.set_status(StreamingStatus::Streaming);
        let mut reader = ChatStreamReader::new(response.body, self.config.stream_timeout);
        loop {
            match reader.next_event(&mut cancel).await {
                Ok(Some(event)) => match turn.on_stream_event(event, now_ms()) {
                    StreamAction::Upsert(part) => {
                        if let Err(err) = self.pipeline.issue_part(part, &mut self.view) {
                            warn!(error = %err, "optimistic part rejected");
                        }
                    }
                    StreamAction::Finish { .. } => {
                        self.set_status(StreamingStatus::Done);
                        return Ok(());
                    }
                    StreamAction::Fail { error } => {
                        self.fail_turn(&turn);
                        return Err(ChatError::Server(error));
                    }
                    StreamAction::Skip => {}
                },
                // Body ended without an explicit finish: the turn is over.
                Ok(None) => {
                    self.set_status(StreamingStatus::Done);
                    return Ok(());
                }
                Err(ChatError::Aborted) => {
                    self.abort_turn(&turn);
                    return Err(ChatError::Aborted);
                }
                Err(err) => {
                    self.fail_turn(&turn);
                    return Err(err);
                }
            }
        }
    }

    /// Failed turn: drop every optimistic entity this turn issued.
    fn fail_turn(&mut self, turn: &TurnIssuer) {
        self.set_status(StreamingStatus::Error);
        self.pipeline.discard_optimistic(
            turn.issued_message_ids(),
            turn.issued_part_ids(),
            &mut self.view,
        );
        if turn.is_placeholder() {
            self.pipeline.retire_session_if_empty(turn.session_id(), &mut self.view);
        }
    }

    /// Aborted turn: back to idle and reap anything past the stop floor.
    fn abort_turn(&mut self, turn: &TurnIssuer) {
        self.set_status(StreamingStatus::Idle);
        let session = turn.session_id().to_string();
        self.pipeline.reap_stale_optimistics(
            &session,
            now_ms(),
            self.config.stop_reap_floor_ms,
            &mut self.view,
        );
    }

    fn set_status(&mut self, status: StreamingStatus) {
        if self.status != status {
            self.status = status;
            self.view.streaming_changed(status);
        }
    }

    fn resolve_retry(&self, message_id: &str) -> Result<(String, Option<String>), ChatError> {
        let entities = &self.pipeline.stores().entities;
        let message = entities
            .message(message_id)
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        let (user, retry_of) = match message.role {
            Role::Assistant => {
                let parent_id = message
                    .parent_id
                    .as_deref()
                    .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
                let parent = entities
                    .message(parent_id)
                    .ok_or_else(|| ChatError::MessageNotFound(parent_id.to_string()))?;
                (parent, Some(message.id.clone()))
            }
            _ => (message, None),
        };
        let text = Self::text_of(entities.parts_of(&user.id));
        if text.is_empty() {
            return Err(ChatError::NothingToResend(user.id.clone()));
        }
        Ok((text, retry_of))
    }

    // ── Conversation operations ───────────────────────────────────────────────

    /// Concatenate the message's text parts and place them on the system
    /// clipboard. The text is also returned; clipboard failure (e.g. a
    /// headless host) is logged, not fatal.
    pub fn copy(&mut self, message_id: &str) -> Result<String, ChatError> {
        let entities = &self.pipeline.stores().entities;
        if entities.message(message_id).is_none() {
            return Err(ChatError::MessageNotFound(message_id.to_string()));
        }
        let text = Self::text_of(entities.parts_of(message_id));
        if let Err(err) = arboard::Clipboard::new().and_then(|mut cb| cb.set_text(text.clone())) {
            warn!(error = %err, "clipboard unavailable, returning text only");
        }
        Ok(text)
    }

    /// Remove a message; its parts go with it.
    pub fn delete(&mut self, message_id: &str) -> Result<(), ChatError> {
        if self.pipeline.delete_message(message_id, &mut self.view) {
            Ok(())
        } else {
            Err(ChatError::MessageNotFound(message_id.to_string()))
        }
    }

    fn text_of(parts: Vec<&weft_protocol::Part>) -> String {
        parts
            .iter()
            .filter_map(|p| match &p.body {
                PartBody::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    // ── Processing state ──────────────────────────────────────────────────────

    pub fn clear_session_state(&mut self, session_id: &str) {
        self.pipeline.clear_session_state(session_id);
    }

    pub fn clear_all_processing_state(&mut self) {
        self.pipeline.clear_all_processing_state();
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    pub fn dedup_stats(&self) -> DedupStats {
        self.pipeline.dedup_stats()
    }

    pub fn ordering_stats(&self) -> OrderingStats {
        self.pipeline.ordering_stats()
    }

    pub fn session_ordering_stats(&self, session_id: &str) -> Option<SessionOrderingStats> {
        self.pipeline.session_ordering_stats(session_id)
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }
}
