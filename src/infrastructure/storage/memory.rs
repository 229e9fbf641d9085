//! In-memory session store.
//!
//! Default storage backend for single-node deployments and tests. Data is
//! lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::domain::{
    sort_newest_first, ChatSession, SessionStore, SessionSummary, StoreError, StoredMessage,
};

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, ChatSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<ChatSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        self.sessions
            .entry(session.id.clone())
            .or_insert_with(|| session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        let mut stored = self
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::NotFound(session.id.clone()))?;

        // History is only appended through record_message
        let messages = std::mem::take(&mut stored.messages);
        *stored = ChatSession {
            messages,
            ..session.clone()
        };
        Ok(())
    }

    async fn record_message(&self, session_id: &str, message: &StoredMessage) -> Result<(), StoreError> {
        let mut stored = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        // Idempotent on retries of the same message
        if stored.messages.last() != Some(message) {
            stored.messages.push(message.clone());
        }
        stored.last_activity = stored.last_activity.max(message.timestamp);
        Ok(())
    }

    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut stored = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        stored.end(ended_at);
        Ok(())
    }

    async fn list_user_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.summary())
            .collect();
        sort_newest_first(&mut summaries);
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn load_active_sessions(&self) -> Result<Vec<ChatSession>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.is_active)
            .map(|s| s.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Sender;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemorySessionStore::new();
        let session = ChatSession::new("s1", "u1", "gpt-4");
        store.create_session(&session).await.unwrap();
        store
            .record_message("s1", &StoredMessage::new(Sender::User, "hi"))
            .await
            .unwrap();
        store.create_session(&session).await.unwrap();

        assert_eq!(store.get("s1").unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_history() {
        let store = InMemorySessionStore::new();
        let mut session = ChatSession::new("s1", "u1", "gpt-4");
        store.create_session(&session).await.unwrap();
        store
            .record_message("s1", &StoredMessage::new(Sender::User, "hi"))
            .await
            .unwrap();

        session.model_id = "claude".into();
        store.update_session(&session).await.unwrap();

        let stored = store.get("s1").unwrap();
        assert_eq!(stored.model_id, "claude");
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_record_message_retry_is_not_duplicated() {
        let store = InMemorySessionStore::new();
        store.create_session(&ChatSession::new("s1", "u1", "gpt-4")).await.unwrap();
        let message = StoredMessage::new(Sender::User, "hi");
        store.record_message("s1", &message).await.unwrap();
        store.record_message("s1", &message).await.unwrap();

        assert_eq!(store.get("s1").unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let store = InMemorySessionStore::new();
        let err = store
            .record_message("nope", &StoredMessage::new(Sender::User, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_end_keeps_first_end_time() {
        let store = InMemorySessionStore::new();
        store.create_session(&ChatSession::new("s1", "u1", "gpt-4")).await.unwrap();
        let first = Utc::now();
        store.end_session("s1", first).await.unwrap();
        store
            .end_session("s1", first + chrono::Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(store.get("s1").unwrap().end_time, Some(first));
        assert!(store.load_active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_user_sessions_newest_first() {
        let store = InMemorySessionStore::new();
        let base = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let mut session = ChatSession::new(*id, "u1", "gpt-4");
            session.start_time = base + chrono::Duration::seconds(i as i64);
            store.create_session(&session).await.unwrap();
        }
        store.create_session(&ChatSession::new("other", "u2", "gpt-4")).await.unwrap();

        let listed = store.list_user_sessions("u1", 2).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }
}
