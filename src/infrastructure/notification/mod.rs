//! Notifier that writes events to the log.
//!
//! Stands in for email/SMS delivery, which is handled outside this service.

use async_trait::async_trait;

use crate::domain::{NotificationEvent, Notifier, NotifyError};

#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<(), NotifyError> {
        match &event {
            NotificationEvent::HelpRequested {
                user_id,
                user_name,
                session_id,
                excerpt,
            } => tracing::info!(
                user_id = %user_id,
                user_name = %user_name,
                session_id = %session_id,
                excerpt = %excerpt,
                "Help requested"
            ),
            NotificationEvent::AdminTakeover {
                admin_id,
                admin_name,
                session_id,
            } => tracing::info!(
                admin_id = %admin_id,
                admin_name = %admin_name,
                session_id = %session_id,
                "Administrator joined session"
            ),
        }
        Ok(())
    }
}
