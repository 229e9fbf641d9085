//! Chat session entity and storage trait.
//!
//! A session is one logical conversation between a user and the assistant,
//! possibly spread over several devices and optionally joined by one
//! assisting administrator.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Sender, StoredMessage};

/// Name given to sessions whose first message has no usable text.
pub const DEFAULT_SESSION_NAME: &str = "New Chat";

/// Maximum length of a generated session name, ellipsis included.
pub const MAX_SESSION_NAME_LENGTH: usize = 50;

/// Response-time samples kept per session.
pub const MAX_RESPONSE_TIME_SAMPLES: usize = 100;

/// One conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,

    /// Owning user. A session id is not a bearer capability: only this user
    /// may resume the session.
    pub user_id: String,

    /// Display name, derived from the first user message when empty
    pub name: String,

    pub model_id: String,

    pub messages: Vec<StoredMessage>,

    pub start_time: DateTime<Utc>,

    pub last_activity: DateTime<Utc>,

    /// Set exactly once, when the session becomes inactive
    pub end_time: Option<DateTime<Utc>>,

    pub is_active: bool,

    pub help_requested: bool,

    pub admin_assisted: bool,

    /// Only set while `admin_assisted` is true
    pub assisting_admin_id: Option<String>,

    pub assisting_admin_name: Option<String>,

    pub total_tokens: u64,

    /// Rolling window of model response times in milliseconds
    pub response_times_ms: VecDeque<u64>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            name: String::new(),
            model_id: model_id.into(),
            messages: Vec::new(),
            start_time: now,
            last_activity: now,
            end_time: None,
            is_active: true,
            help_requested: false,
            admin_assisted: false,
            assisting_admin_id: None,
            assisting_admin_name: None,
            total_tokens: 0,
            response_times_ms: VecDeque::new(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    /// Append a message. The first user message names an unnamed session.
    pub fn push_message(&mut self, message: StoredMessage) {
        if self.name.is_empty() && message.sender == Sender::User {
            self.name = generate_session_name(&message.content, MAX_SESSION_NAME_LENGTH);
        }
        self.last_activity = message.timestamp.max(self.last_activity);
        self.messages.push(message);
    }

    /// Mark the session inactive. Returns false if it already was.
    pub fn end(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.end_time = Some(at);
        self.last_activity = at;
        true
    }

    /// Claim the session for an administrator. Fails if any administrator,
    /// including the same one, already assists it.
    pub fn assign_admin(&mut self, admin_id: &str, admin_name: &str) -> bool {
        if self.admin_assisted {
            return false;
        }
        self.admin_assisted = true;
        self.assisting_admin_id = Some(admin_id.to_string());
        self.assisting_admin_name = Some(admin_name.to_string());
        true
    }

    /// Release the session. Only the assisting administrator may do so.
    pub fn release_admin(&mut self, admin_id: &str) -> bool {
        if !self.is_assisted_by(admin_id) {
            return false;
        }
        self.admin_assisted = false;
        self.assisting_admin_id = None;
        self.assisting_admin_name = None;
        true
    }

    pub fn is_assisted_by(&self, admin_id: &str) -> bool {
        self.admin_assisted && self.assisting_admin_id.as_deref() == Some(admin_id)
    }

    pub fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times_ms.len() == MAX_RESPONSE_TIME_SAMPLES {
            self.response_times_ms.pop_front();
        }
        self.response_times_ms.push_back(elapsed.as_millis() as u64);
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        if self.response_times_ms.is_empty() {
            return None;
        }
        let total: u64 = self.response_times_ms.iter().sum();
        Some(Duration::from_millis(total / self.response_times_ms.len() as u64))
    }

    pub fn max_response_time(&self) -> Option<Duration> {
        self.response_times_ms.iter().max().map(|ms| Duration::from_millis(*ms))
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            model_id: self.model_id.clone(),
            message_count: self.messages.len(),
            start_time: self.start_time,
            last_activity: self.last_activity,
            end_time: self.end_time,
            is_active: self.is_active,
            help_requested: self.help_requested,
            admin_assisted: self.admin_assisted,
            assisting_admin_id: self.assisting_admin_id.clone(),
            assisting_admin_name: self.assisting_admin_name.clone(),
            total_tokens: self.total_tokens,
            average_response_ms: self.average_response_time().map(|d| d.as_millis() as u64),
        }
    }
}

/// Listing view of a session without its message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub model_id: String,
    pub message_count: usize,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub help_requested: bool,
    pub admin_assisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assisting_admin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assisting_admin_name: Option<String>,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_response_ms: Option<u64>,
}

/// Sort summaries newest first by start time.
pub fn sort_newest_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));
}

/// Derive a session name from the first message: its first line, or its
/// first sentence, truncated at a word boundary.
pub fn generate_session_name(first_message: &str, max_length: usize) -> String {
    const ELLIPSIS: &str = "...";

    let message = first_message.trim();
    if message.is_empty() {
        return DEFAULT_SESSION_NAME.to_string();
    }

    let name = first_sentence_or_line(message);
    if name.chars().count() <= max_length {
        return name.to_string();
    }
    if max_length <= ELLIPSIS.len() {
        return ELLIPSIS.to_string();
    }

    let mut truncated = truncate_at_word_boundary(name, max_length - ELLIPSIS.len());
    truncated.push_str(ELLIPSIS);
    truncated
}

fn first_sentence_or_line(s: &str) -> &str {
    if let Some(end) = s.find(&['\n', '\r'][..]) {
        return s[..end].trim();
    }
    if let Some(end) = s.find(&['.', '?', '!'][..]) {
        return s[..=end].trim();
    }
    s
}

fn truncate_at_word_boundary(s: &str, max_chars: usize) -> String {
    let truncated: String = s.chars().take(max_chars).collect();
    match truncated.rfind(' ') {
        Some(space) if space > 0 => truncated[..space].trim().to_string(),
        _ => truncated,
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Storage failure, split so callers can decide whether to log and continue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Worth retrying later (timeouts, connection resets)
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Permanent(String),

    #[error("session {0} not found in storage")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Persistent storage for sessions. Every operation is idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert the session if it is not stored yet.
    async fn create_session(&self, session: &ChatSession) -> Result<(), StoreError>;

    /// Overwrite session metadata (flags, model, metrics).
    async fn update_session(&self, session: &ChatSession) -> Result<(), StoreError>;

    /// Append a message to a stored session.
    async fn record_message(&self, session_id: &str, message: &StoredMessage) -> Result<(), StoreError>;

    /// Mark a stored session ended. Ending twice keeps the first end time.
    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// A user's sessions, newest first.
    async fn list_user_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>, StoreError>;

    /// Sessions still active, used to rebuild the registry at startup.
    async fn load_active_sessions(&self) -> Result<Vec<ChatSession>, StoreError>;
}
