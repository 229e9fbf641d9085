//! Stored chat message entity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The session owner
    #[default]
    User,
    /// The model
    Ai,
    /// An assisting administrator
    Admin,
    /// Server-generated status
    System,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One message in a conversation, in the order it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub content: String,

    pub sender: Sender,

    pub timestamp: DateTime<Utc>,

    /// Uploaded file or voice recording reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl StoredMessage {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender,
            timestamp: Utc::now(),
            file_id: None,
            file_url: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_file(mut self, file_id: impl Into<String>, file_url: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self.file_url = Some(file_url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn has_file(&self) -> bool {
        self.file_id.is_some()
    }
}
