//! WebSocket Message Types
//!
//! One JSON object per frame. Keys are snake_case and absent optional
//! fields are omitted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

use crate::domain::{Sender, StoredMessage};
use crate::shared::error::{ChatError, ErrorCode, ErrorInfo};

pub const MAX_CONTENT_LENGTH: usize = 10_000;
pub const MAX_METADATA_VALUE_LENGTH: usize = 1_000;

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserMessage,
    AiResponse,
    FileUpload,
    VoiceMessage,
    HelpRequest,
    ModelSelect,
    AdminTakeover,
    Loading,
    ConnectionStatus,
    Error,
    /// Any tag this server does not know
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AiResponse => "ai_response",
            Self::FileUpload => "file_upload",
            Self::VoiceMessage => "voice_message",
            Self::HelpRequest => "help_request",
            Self::ModelSelect => "model_select",
            Self::AdminTakeover => "admin_takeover",
            Self::Loading => "loading",
            Self::ConnectionStatus => "connection_status",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Types a client may send.
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            Self::UserMessage
                | Self::FileUpload
                | Self::VoiceMessage
                | Self::HelpRequest
                | Self::ModelSelect
                | Self::AdminTakeover
        )
    }
}

/// A frame in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 128, message = "session_id is too long"))]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 10000, message = "content is too long"))]
    pub content: Option<String>,

    #[serde(default)]
    pub sender: Sender,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 100, message = "model_id is too long"))]
    pub model_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 255, message = "file_id is too long"))]
    pub file_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2048, message = "file_url is too long"))]
    pub file_url: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    /// Receive time when the client omits it
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    pub fn new(message_type: MessageType, sender: Sender) -> Self {
        Self {
            message_type,
            session_id: None,
            content: None,
            sender,
            model_id: None,
            file_id: None,
            file_url: None,
            metadata: HashMap::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Parse and validate an inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ChatError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|_| ChatError::validation(ErrorCode::InvalidFormat, "Message is not valid JSON"))?;

        let object = value
            .as_object()
            .ok_or_else(|| ChatError::validation(ErrorCode::InvalidFormat, "Message must be a JSON object"))?;
        if !object.contains_key("type") {
            return Err(ChatError::validation(ErrorCode::MissingField, "type is required"));
        }

        let message: WireMessage = serde_json::from_value(value)
            .map_err(|_| ChatError::validation(ErrorCode::InvalidFormat, "Invalid message format"))?;

        message.validate().map_err(validation_error)?;
        message.validate_metadata()?;

        match message.message_type {
            MessageType::Unknown => Err(ErrorCode::UnknownMessageType.into()),
            t if !t.is_inbound() => Err(ErrorCode::UnknownMessageType.into()),
            MessageType::FileUpload | MessageType::VoiceMessage => {
                message.require_file()?;
                Ok(message)
            }
            _ => Ok(message),
        }
    }

    fn validate_metadata(&self) -> Result<(), ChatError> {
        match self
            .metadata
            .iter()
            .find(|(_, v)| v.chars().count() > MAX_METADATA_VALUE_LENGTH)
        {
            Some((key, _)) => Err(ChatError::validation(
                ErrorCode::InvalidFormat,
                format!("metadata value for {} is too long", key),
            )),
            None => Ok(()),
        }
    }

    fn require_file(&self) -> Result<(), ChatError> {
        if self.file_id.as_deref().map_or(true, str::is_empty) {
            return Err(ChatError::validation(ErrorCode::MissingField, "file_id is required"));
        }
        if self.file_url.as_deref().map_or(true, str::is_empty) {
            return Err(ChatError::validation(ErrorCode::MissingField, "file_url is required"));
        }
        Ok(())
    }

    /// Trimmed content, if any is left.
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn loading(session_id: &str) -> Self {
        Self::new(MessageType::Loading, Sender::System).with_session(session_id)
    }

    pub fn ai_response(session_id: &str, model_id: &str, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::AiResponse, Sender::Ai)
            .with_session(session_id)
            .with_content(content);
        message.model_id = Some(model_id.to_string());
        message
    }

    /// A streamed fragment of an AI reply. The last frame of a turn is a
    /// plain `ai_response` carrying the full text.
    pub fn ai_chunk(session_id: &str, model_id: &str, chunk: impl Into<String>) -> Self {
        Self::ai_response(session_id, model_id, chunk)
            .with_metadata("streaming", "true")
            .with_metadata("done", "false")
    }

    pub fn is_partial(&self) -> bool {
        self.metadata.get("streaming").map(String::as_str) == Some("true")
    }

    pub fn status(session_id: Option<&str>, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::ConnectionStatus, Sender::System).with_content(content);
        message.session_id = session_id.map(str::to_string);
        message
    }

    pub fn error(session_id: Option<&str>, error: &ChatError) -> Self {
        let mut message = Self::new(MessageType::Error, Sender::System);
        message.session_id = session_id.map(str::to_string);
        message.error = Some(error.to_info());
        message
    }

    /// Echo of a stored conversation message to the other participants.
    pub fn from_stored(message_type: MessageType, session_id: &str, stored: &StoredMessage) -> Self {
        Self {
            message_type,
            session_id: Some(session_id.to_string()),
            content: Some(stored.content.clone()),
            sender: stored.sender,
            model_id: None,
            file_id: stored.file_id.clone(),
            file_url: stored.file_url.clone(),
            metadata: stored.metadata.clone(),
            error: None,
            timestamp: stored.timestamp,
        }
    }

    /// The conversation record of an inbound message.
    pub fn to_stored(&self, sender: Sender) -> StoredMessage {
        let mut stored = StoredMessage::new(sender, self.content.clone().unwrap_or_default())
            .with_timestamp(self.timestamp)
            .with_metadata(self.metadata.clone());
        if let (Some(id), Some(url)) = (&self.file_id, &self.file_url) {
            stored = stored.with_file(id.clone(), url.clone());
        }
        stored
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Convert validation errors to a client error naming the first field.
fn validation_error(errors: ValidationErrors) -> ChatError {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    let message = fields
        .first()
        .and_then(|(field, errs)| {
            errs.first().map(|e| {
                e.message
                    .clone()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("{} is invalid", field))
            })
        })
        .unwrap_or_else(|| "Invalid message format".to_string());

    ChatError::validation(ErrorCode::InvalidFormat, message)
}
