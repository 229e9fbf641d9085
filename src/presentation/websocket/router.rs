//! Message Router
//!
//! Turns one inbound frame into session mutations, collaborator calls and
//! outbound frames. Frames of a connection are dispatched one at a time in
//! arrival order; a model turn runs under a token derived from the
//! originating connection so a disconnect or shutdown aborts the provider
//! call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::manager::ConnectionManager;
use super::messages::{MessageType, WireMessage};
use crate::application::services::{RateLimiters, SessionError, SessionRegistry, SlidingWindowLimiter};
use crate::config::Settings;
use crate::domain::{
    estimate_tokens, ChatSession, CompletionRequest, LlmError, LlmProvider, NotificationEvent,
    Notifier, Sender, SessionStore, StoreError, StoredMessage,
};
use crate::infrastructure::metrics;
use crate::presentation::middleware::auth::AuthUser;
use crate::shared::error::{ChatError, ErrorCategory, ErrorCode};

/// Characters of the last user message included in a help alert.
const HELP_EXCERPT_LENGTH: usize = 200;

/// External services the router calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SessionStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub llm_timeout: Duration,
    pub storage_timeout: Duration,
}

impl RouterConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            llm_timeout: settings.llm.timeout(),
            storage_timeout: settings.storage.timeout(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(60),
            storage_timeout: Duration::from_secs(5),
        }
    }
}

pub struct MessageRouter {
    sessions: Arc<SessionRegistry>,
    connections: Arc<ConnectionManager>,
    limiters: RateLimiters,
    services: Collaborators,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        connections: Arc<ConnectionManager>,
        limiters: RateLimiters,
        services: Collaborators,
        config: RouterConfig,
    ) -> Self {
        Self {
            sessions,
            connections,
            limiters,
            services,
            config,
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Parse a text frame and dispatch it. Parse failures are answered on
    /// the originating connection only.
    pub async fn handle_frame(&self, conn: &Arc<Connection>, text: &str) {
        match WireMessage::parse(text) {
            Ok(message) => self.dispatch(conn, message).await,
            Err(e) => self.reply_error(conn, None, e),
        }
    }

    pub async fn dispatch(&self, conn: &Arc<Connection>, message: WireMessage) {
        metrics::record_message_received(message.message_type.as_str());
        let requested = message.session_id.clone();

        if let Err(e) = self.route(conn, message).await {
            self.reply_error(conn, requested.as_deref(), e);
        }
    }

    /// Release the connection's hold on its session. Safe to call twice.
    pub fn connection_closed(&self, conn: &Connection) {
        if let Some(session_id) = conn.take_session_id() {
            if let Err(e) = self.sessions.detach_connection(&session_id) {
                tracing::debug!(session_id = %session_id, error = %e, "Detach skipped");
            }
        }
    }

    async fn route(&self, conn: &Arc<Connection>, message: WireMessage) -> Result<(), ChatError> {
        check_rate(&self.limiters.messages, conn.user_id())?;

        match message.message_type {
            MessageType::UserMessage => self.handle_user_message(conn, message).await,
            MessageType::FileUpload | MessageType::VoiceMessage => {
                self.handle_file_message(conn, message).await
            }
            MessageType::HelpRequest => self.handle_help_request(conn, message).await,
            MessageType::ModelSelect => self.handle_model_select(conn, message).await,
            MessageType::AdminTakeover => self.handle_admin_takeover(conn, message).await,
            _ => Err(ErrorCode::UnknownMessageType.into()),
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    async fn handle_user_message(
        &self,
        conn: &Arc<Connection>,
        message: WireMessage,
    ) -> Result<(), ChatError> {
        if let Some(session) = self.assisted_session_for_admin(conn, &message) {
            return self.relay_admin_message(conn, session, message).await;
        }

        if message.text().is_none() {
            return Err(ChatError::validation(ErrorCode::MissingField, "content is required"));
        }

        let session = self.resolve_session(conn, message.session_id.as_deref()).await?;
        let stored = message.to_stored(Sender::User);
        let session = self
            .sessions
            .record_message(&session.id, stored.clone())
            .map_err(session_error)?;

        tracing::debug!(
            session_id = %session.id,
            user_id = %conn.user_id(),
            content_length = stored.content.len(),
            "User message received"
        );

        if let Err(e) = self.persist_message(&session.id, &stored).await {
            self.reply_error(conn, Some(&session.id), e);
        }

        if session.admin_assisted {
            self.relay_to_admin(&session, &stored);
            return Ok(());
        }

        self.run_turn(conn, session).await;
        Ok(())
    }

    async fn handle_file_message(
        &self,
        conn: &Arc<Connection>,
        message: WireMessage,
    ) -> Result<(), ChatError> {
        let session = self.resolve_session(conn, message.session_id.as_deref()).await?;
        let stored = message.to_stored(Sender::User);
        let session = self
            .sessions
            .record_message(&session.id, stored.clone())
            .map_err(session_error)?;

        tracing::info!(
            session_id = %session.id,
            user_id = %conn.user_id(),
            file_id = ?stored.file_id,
            kind = message.message_type.as_str(),
            "File received"
        );

        if let Err(e) = self.persist_message(&session.id, &stored).await {
            self.reply_error(conn, Some(&session.id), e);
        }

        // Every participant sees the attachment
        let echo = WireMessage::from_stored(message.message_type, &session.id, &stored);
        self.connections.broadcast_to_user(&session.user_id, &echo);

        if session.admin_assisted {
            self.relay_to_admin(&session, &stored);
            return Ok(());
        }

        // Voice always gets a reply; a file only when it comes with a question
        let expects_reply =
            message.message_type == MessageType::VoiceMessage || message.text().is_some();
        if expects_reply {
            self.run_turn(conn, session).await;
        }
        Ok(())
    }

    async fn handle_help_request(
        &self,
        conn: &Arc<Connection>,
        message: WireMessage,
    ) -> Result<(), ChatError> {
        let session = self.resolve_session(conn, message.session_id.as_deref()).await?;
        let session = self
            .sessions
            .mark_help_requested(&session.id)
            .map_err(session_error)?;

        tracing::info!(session_id = %session.id, user_id = %conn.user_id(), "Help request received");

        let excerpt: String = session
            .messages
            .iter()
            .rev()
            .find(|m| m.sender == Sender::User)
            .map(|m| m.content.chars().take(HELP_EXCERPT_LENGTH).collect())
            .unwrap_or_default();

        self.notify(NotificationEvent::HelpRequested {
            user_id: conn.user_id().to_string(),
            user_name: conn.name().to_string(),
            session_id: session.id.clone(),
            excerpt,
        });
        let ack = WireMessage::status(
            Some(&session.id),
            "Help request sent. An administrator will join your session shortly.",
        );
        self.send_or_log(conn, &ack);

        if let Err(e) = self.persist_session(&session).await {
            self.reply_error(conn, Some(&session.id), e);
        }
        Ok(())
    }

    async fn handle_model_select(
        &self,
        conn: &Arc<Connection>,
        message: WireMessage,
    ) -> Result<(), ChatError> {
        let model_id = message
            .model_id
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ChatError::validation(ErrorCode::MissingField, "model_id is required"))?;

        let session = self.resolve_session(conn, message.session_id.as_deref()).await?;
        let session = self
            .sessions
            .set_model(&session.id, model_id)
            .map_err(session_error)?;

        tracing::info!(session_id = %session.id, model_id = %model_id, "Model selected");

        let mut ack = WireMessage::status(Some(&session.id), format!("Model changed to {}", model_id));
        ack.model_id = Some(model_id.to_string());
        self.send_or_log(conn, &ack);

        if let Err(e) = self.persist_session(&session).await {
            self.reply_error(conn, Some(&session.id), e);
        }
        Ok(())
    }

    async fn handle_admin_takeover(
        &self,
        conn: &Arc<Connection>,
        message: WireMessage,
    ) -> Result<(), ChatError> {
        if !conn.is_admin() {
            tracing::warn!(user_id = %conn.user_id(), "Takeover attempted without admin role");
            return Err(ErrorCode::Forbidden.into());
        }
        check_rate(&self.limiters.admin, &admin_rate_key(conn.user_id()))?;

        let session_id = message
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ChatError::validation(ErrorCode::MissingField, "session_id is required"))?;

        let session = self
            .take_over_session(conn.user(), session_id)
            .await
            .map_err(session_error)?;

        let ack = WireMessage::status(
            Some(&session.id),
            format!("You are now assisting session {}", session.id),
        )
        .with_metadata("user_id", session.user_id.clone());
        self.send_or_log(conn, &ack);
        Ok(())
    }

    // ========================================================================
    // Admin assistance
    // ========================================================================

    /// Claim exclusive assistance of a session. Shared by the WebSocket
    /// `admin_takeover` frame and the HTTP admin API.
    pub async fn take_over_session(
        &self,
        admin: &AuthUser,
        session_id: &str,
    ) -> Result<ChatSession, SessionError> {
        let session = match self
            .sessions
            .set_admin_assistance(session_id, &admin.user_id, &admin.name)
        {
            Ok(session) => session,
            Err(e) => {
                let outcome = match &e {
                    SessionError::AlreadyAssisted { .. } => "conflict",
                    SessionError::NotFound(_) => "not_found",
                    _ => "error",
                };
                metrics::record_admin_takeover(outcome);
                tracing::info!(
                    session_id = %session_id,
                    admin_id = %admin.user_id,
                    outcome = outcome,
                    "Admin takeover refused"
                );
                return Err(e);
            }
        };

        metrics::record_admin_takeover("success");
        tracing::info!(
            session_id = %session.id,
            admin_id = %admin.user_id,
            user_id = %session.user_id,
            "Admin takeover"
        );

        let joined = WireMessage::new(MessageType::AdminTakeover, Sender::Admin)
            .with_session(session.id.clone())
            .with_content(format!("Administrator {} has joined the session", admin.name))
            .with_metadata("admin_id", admin.user_id.clone())
            .with_metadata("admin_name", admin.name.clone());
        self.connections.broadcast_to_user(&session.user_id, &joined);

        self.notify(NotificationEvent::AdminTakeover {
            admin_id: admin.user_id.clone(),
            admin_name: admin.name.clone(),
            session_id: session.id.clone(),
        });
        if let Err(e) = self.persist_session(&session).await {
            self.error_to_user(&admin.user_id, &session.id, e);
        }

        Ok(session)
    }

    /// Release assistance held by `admin`, handing the session back to
    /// the model.
    pub async fn leave_session(
        &self,
        admin: &AuthUser,
        session_id: &str,
    ) -> Result<ChatSession, SessionError> {
        let session = self
            .sessions
            .clear_admin_assistance(session_id, &admin.user_id)?;

        tracing::info!(
            session_id = %session.id,
            admin_id = %admin.user_id,
            user_id = %session.user_id,
            "Admin left session"
        );

        let left = WireMessage::status(
            Some(&session.id),
            format!("Administrator {} has left the session", admin.name),
        )
        .with_metadata("admin_id", admin.user_id.clone())
        .with_metadata("admin_name", admin.name.clone());
        self.connections.broadcast_to_user(&session.user_id, &left);
        if let Err(e) = self.persist_session(&session).await {
            self.error_to_user(&admin.user_id, &session.id, e);
        }

        Ok(session)
    }

    /// The session an admin's `user_message` is addressed to, if the admin
    /// is currently assisting it.
    fn assisted_session_for_admin(
        &self,
        conn: &Connection,
        message: &WireMessage,
    ) -> Option<ChatSession> {
        if !conn.is_admin() {
            return None;
        }
        let session = self.sessions.get(message.session_id.as_deref()?)?;
        (session.is_assisted_by(conn.user_id()) && !session.is_owned_by(conn.user_id()))
            .then_some(session)
    }

    async fn relay_admin_message(
        &self,
        conn: &Arc<Connection>,
        session: ChatSession,
        message: WireMessage,
    ) -> Result<(), ChatError> {
        if message.text().is_none() {
            return Err(ChatError::validation(ErrorCode::MissingField, "content is required"));
        }

        let stored = message.to_stored(Sender::Admin);
        self.sessions
            .record_message(&session.id, stored.clone())
            .map_err(session_error)?;

        let frame = WireMessage::from_stored(MessageType::UserMessage, &session.id, &stored);
        self.connections.broadcast_to_user(&session.user_id, &frame);

        if let Err(e) = self.persist_message(&session.id, &stored).await {
            self.reply_error(conn, Some(&session.id), e);
        }
        Ok(())
    }

    fn relay_to_admin(&self, session: &ChatSession, stored: &StoredMessage) {
        let Some(admin_id) = session.assisting_admin_id.as_deref() else {
            return;
        };
        let message_type = if stored.has_file() {
            MessageType::FileUpload
        } else {
            MessageType::UserMessage
        };
        let frame = WireMessage::from_stored(message_type, &session.id, stored)
            .with_metadata("user_id", session.user_id.clone());
        let report = self.connections.broadcast_to_user(admin_id, &frame);
        if report.delivered == 0 {
            tracing::warn!(
                session_id = %session.id,
                admin_id = %admin_id,
                "Assisting admin has no live connection"
            );
        }
    }

    // ========================================================================
    // Model turns
    // ========================================================================

    /// One model turn: loading indicator, streamed chunks, final reply. All
    /// frames go to every connection of the session owner. Failures are
    /// broadcast as an error frame and leave the session untouched apart
    /// from the already recorded user message.
    async fn run_turn(&self, conn: &Connection, session: ChatSession) {
        let owner = session.user_id.clone();
        let session_id = session.id.clone();
        let model_id = session.model_id.clone();

        self.connections
            .broadcast_to_user(&owner, &WireMessage::loading(&session_id));

        let cancel = conn.cancellation().child_token();
        let deadline = Instant::now() + self.config.llm_timeout;
        let request = CompletionRequest {
            session_id: session_id.clone(),
            model_id: model_id.clone(),
            conversation: session.messages,
            deadline,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout_at(
            deadline,
            self.stream_reply(&owner, &session_id, &model_id, request, cancel.clone()),
        )
        .await
        .unwrap_or(Err(LlmError::Timeout));
        let elapsed = started.elapsed();

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                // Stops the provider if it is still running
                cancel.cancel();
                self.turn_failed(&owner, &session_id, &model_id, e, elapsed);
                return;
            }
        };

        metrics::record_llm_request("success", elapsed.as_secs_f64());

        let stored = StoredMessage::new(Sender::Ai, reply.clone());
        let recorded = self
            .sessions
            .record_message(&session_id, stored.clone())
            .and_then(|_| {
                self.sessions
                    .record_turn_metrics(&session_id, elapsed, estimate_tokens(&reply))
            });
        if let Err(e) = recorded {
            tracing::warn!(session_id = %session_id, error = %e, "Session vanished during turn");
        }

        self.connections.broadcast_to_user(
            &owner,
            &WireMessage::ai_response(&session_id, &model_id, reply),
        );

        // The reply has gone out; storage failures are reported after it
        let persisted = match self.persist_message(&session_id, &stored).await {
            Ok(()) => match self.sessions.get(&session_id) {
                Some(session) => self.persist_session(&session).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            self.reply_error(conn, Some(&session_id), e);
        }
    }

    async fn stream_reply(
        &self,
        owner: &str,
        session_id: &str,
        model_id: &str,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<String, LlmError> {
        let mut stream = self.services.llm.stream(request, cancel.clone()).await?;
        let mut reply = String::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) if chunk.is_empty() => {}
                    Some(Ok(chunk)) => {
                        self.connections
                            .broadcast_to_user(owner, &WireMessage::ai_chunk(session_id, model_id, chunk.as_str()));
                        reply.push_str(&chunk);
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        if reply.trim().is_empty() {
            return Err(LlmError::Unavailable("empty reply".into()));
        }
        Ok(reply)
    }

    fn turn_failed(
        &self,
        owner: &str,
        session_id: &str,
        model_id: &str,
        error: LlmError,
        elapsed: Duration,
    ) {
        let (outcome, code) = match &error {
            LlmError::Timeout => ("timeout", ErrorCode::LlmTimeout),
            LlmError::Cancelled => ("cancelled", ErrorCode::LlmUnavailable),
            LlmError::Unavailable(_) | LlmError::Rejected(_) => ("error", ErrorCode::LlmUnavailable),
        };
        metrics::record_llm_request(outcome, elapsed.as_secs_f64());

        if matches!(error, LlmError::Cancelled) {
            tracing::debug!(session_id = %session_id, "Model turn cancelled");
            return;
        }

        tracing::error!(
            session_id = %session_id,
            model_id = %model_id,
            error = %error,
            elapsed_ms = elapsed.as_millis() as u64,
            "Model turn failed"
        );

        let chat_error = ChatError::upstream(code, error);
        metrics::record_chat_error(chat_error.code.as_str());
        self.connections
            .broadcast_to_user(owner, &WireMessage::error(Some(session_id), &chat_error));
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Resume the requested (or the connection's current) session, or start
    /// a new one, and attach it to the connection.
    async fn resolve_session(
        &self,
        conn: &Connection,
        requested: Option<&str>,
    ) -> Result<ChatSession, ChatError> {
        let requested = requested
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| conn.session_id());

        let resolved = self
            .sessions
            .get_or_create_session(requested.as_deref(), conn.user_id())
            .map_err(session_error)?;
        let session = resolved.session;

        if resolved.created {
            tracing::info!(session_id = %session.id, user_id = %conn.user_id(), "Session started");
            let store = self.services.store.clone();
            let snapshot = session.clone();
            let created = self
                .store_call("create_session", &session.id, async move {
                    store.create_session(&snapshot).await
                })
                .await;
            if let Err(e) = created {
                self.reply_error(conn, Some(&session.id), e);
            }
        }

        self.attach(conn, &session.id);
        Ok(session)
    }

    fn attach(&self, conn: &Connection, session_id: &str) {
        match conn.set_session_id(session_id) {
            Some(previous) if previous == session_id => return,
            Some(previous) => {
                let _ = self.sessions.detach_connection(&previous);
            }
            None => {}
        }
        if let Err(e) = self.sessions.attach_connection(session_id) {
            tracing::warn!(session_id = %session_id, error = %e, "Attach failed");
        }
    }

    async fn persist_message(&self, session_id: &str, message: &StoredMessage) -> Result<(), ChatError> {
        let store = self.services.store.clone();
        let id = session_id.to_string();
        let message = message.clone();
        self.store_call("record_message", session_id, async move {
            store.record_message(&id, &message).await
        })
        .await
    }

    async fn persist_session(&self, session: &ChatSession) -> Result<(), ChatError> {
        let store = self.services.store.clone();
        let snapshot = session.clone();
        self.store_call("update_session", &session.id, async move {
            store.update_session(&snapshot).await
        })
        .await
    }

    /// Run a storage call under the storage deadline. Failures are logged
    /// here and never retried.
    async fn store_call<F>(&self, operation: &'static str, session_id: &str, call: F) -> Result<(), ChatError>
    where
        F: Future<Output = Result<(), StoreError>>,
    {
        match tokio::time::timeout(self.config.storage_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if e.is_transient() {
                    tracing::warn!(operation, session_id = %session_id, error = %e, "Storage call failed");
                } else {
                    tracing::error!(operation, session_id = %session_id, error = %e, "Storage call failed");
                }
                Err(ChatError::upstream(ErrorCode::StorageError, e))
            }
            Err(_) => {
                tracing::warn!(operation, session_id = %session_id, "Storage call timed out");
                Err(ChatError::upstream(
                    ErrorCode::StorageError,
                    StoreError::Transient("deadline exceeded".into()),
                ))
            }
        }
    }

    fn notify(&self, event: NotificationEvent) {
        let notifier = self.services.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(event).await {
                tracing::warn!(error = %e, "Notification failed");
            }
        });
    }

    fn send_or_log(&self, conn: &Connection, message: &WireMessage) {
        if let Err(e) = conn.send_message(message) {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Reply dropped");
        }
    }

    /// Error frame to every connection of `user_id`, for operations that are
    /// not tied to one connection.
    fn error_to_user(&self, user_id: &str, session_id: &str, error: ChatError) {
        metrics::record_chat_error(error.code.as_str());
        self.connections
            .broadcast_to_user(user_id, &WireMessage::error(Some(session_id), &error));
    }

    /// Answer the originating connection with an error frame.
    fn reply_error(&self, conn: &Connection, session_id: Option<&str>, error: ChatError) {
        match error.category() {
            ErrorCategory::Validation | ErrorCategory::ResourceExhaustion => tracing::debug!(
                connection_id = %conn.id(),
                code = %error.code,
                "Request rejected"
            ),
            ErrorCategory::Authorization | ErrorCategory::Conflict => tracing::info!(
                connection_id = %conn.id(),
                user_id = %conn.user_id(),
                code = %error.code,
                "Request refused"
            ),
            ErrorCategory::Upstream => tracing::error!(
                connection_id = %conn.id(),
                code = %error.code,
                error = ?error.source,
                "Request failed"
            ),
        }
        metrics::record_chat_error(error.code.as_str());

        let session_id = session_id.map(str::to_string).or_else(|| conn.session_id());
        self.send_or_log(conn, &WireMessage::error(session_id.as_deref(), &error));
    }
}

fn check_rate(limiter: &SlidingWindowLimiter, key: &str) -> Result<(), ChatError> {
    limiter
        .check(key)
        .map(|_| ())
        .map_err(|info| ChatError::rate_limited(info.retry_after))
}

/// Key shared with the HTTP admin rate limit middleware.
pub fn admin_rate_key(admin_id: &str) -> String {
    format!("user:{}", admin_id)
}

fn session_error(error: SessionError) -> ChatError {
    match error {
        SessionError::NotFound(_) => ErrorCode::SessionNotFound.into(),
        SessionError::OwnershipViolation | SessionError::NotAssisting => ErrorCode::Forbidden.into(),
        SessionError::AlreadyAssisted { .. } => ErrorCode::Conflict.into(),
        SessionError::IdExhausted => ChatError::upstream(ErrorCode::ServiceError, error),
    }
}
