//! Notification contract.
//!
//! Notifications are fire-and-forget: the router spawns each call and only
//! logs failures.

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A user asked for a human
    HelpRequested {
        user_id: String,
        user_name: String,
        session_id: String,
        /// Last user message, for context in the alert
        excerpt: String,
    },
    /// An administrator joined a session
    AdminTakeover {
        admin_id: String,
        admin_name: String,
        session_id: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> Result<(), NotifyError>;
}
