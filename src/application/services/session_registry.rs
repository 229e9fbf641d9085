//! Session Registry
//!
//! Single source of truth for which conversation sessions exist, who owns
//! them and when they expire.
//!
//! Locking: the outer `RwLock` guards the id -> session map, each session
//! sits behind its own `Mutex`. Always take the map lock before a session
//! lock. Mutations hold the map's read lock for their whole duration so the
//! sweep (which needs the write lock) can never remove a session mid-update.
//! Callers only ever receive cloned snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Settings;
use crate::domain::{sort_newest_first, ChatSession, SessionSummary, StoredMessage};
use crate::shared::background::PeriodicTask;

/// Attempts at drawing an unused session id before giving up.
const ID_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session does not belong to the requesting user")]
    OwnershipViolation,

    #[error("session is already assisted by administrator {admin_id}")]
    AlreadyAssisted { admin_id: String },

    #[error("session is not assisted by this administrator")]
    NotAssisting,

    #[error("could not allocate a unique session id")]
    IdExhausted,
}

/// Registry timing configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long after its last activity a session can still be resumed
    pub reconnect_grace: Duration,
    /// Idle time after which the sweep removes a session
    pub ttl: Duration,
    /// Sweep period
    pub cleanup_interval: Duration,
    /// Model assigned to new sessions
    pub default_model: String,
}

impl RegistryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reconnect_grace: settings.session.reconnect_grace(),
            ttl: settings.session.ttl(),
            cleanup_interval: settings.session.cleanup_interval(),
            default_model: settings.llm.default_model.clone(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(900),
            ttl: Duration::from_secs(900),
            cleanup_interval: Duration::from_secs(300),
            default_model: "gpt-4".into(),
        }
    }
}

/// Result of [`SessionRegistry::get_or_create_session`].
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session: ChatSession,
    /// True when a fresh session was allocated
    pub created: bool,
}

/// Counts reported by [`SessionRegistry::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub inactive: usize,
    pub total: usize,
    pub admin_assisted: usize,
    pub attached_connections: usize,
}

struct SessionEntry {
    session: ChatSession,
    last_activity: Instant,
    attached: usize,
}

impl SessionEntry {
    fn new(session: ChatSession) -> Self {
        Self {
            session,
            last_activity: Instant::now(),
            attached: 0,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.session.last_activity = Utc::now();
    }

    fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn resumable(&self, now: Instant, grace: Duration) -> bool {
        self.session.is_active && (self.attached > 0 || self.idle(now) <= grace)
    }

    fn sweepable(&self, now: Instant, ttl: Duration) -> bool {
        let in_use = self.session.is_active && self.attached > 0;
        !in_use && self.idle(now) > ttl
    }
}

type Entries = HashMap<String, Arc<Mutex<SessionEntry>>>;

pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<Entries>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl SessionRegistry {
    /// Create a registry without a sweep task.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a registry and start its expiry sweep.
    pub fn start(config: RegistryConfig) -> Arc<Self> {
        Self::start_with_hook(config, |_| {})
    }

    /// Like [`start`](Self::start), handing every batch of swept sessions
    /// to `on_expired`.
    pub fn start_with_hook<F>(config: RegistryConfig, on_expired: F) -> Arc<Self>
    where
        F: Fn(Vec<ChatSession>) + Send + 'static,
    {
        let interval = config.cleanup_interval;
        let registry = Arc::new(Self::new(config));

        let weak: Weak<Self> = Arc::downgrade(&registry);
        let task = PeriodicTask::spawn("session-sweep", interval, move || {
            if let Some(registry) = weak.upgrade() {
                let expired = registry.sweep();
                if !expired.is_empty() {
                    tracing::info!(removed = expired.len(), "Swept expired sessions");
                    on_expired(expired);
                }
            }
        });
        *registry.sweeper.lock() = Some(task);

        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocate a new session for `user_id`.
    pub fn create_session(&self, user_id: &str) -> Result<ChatSession, SessionError> {
        let mut sessions = self.sessions.write();

        for _ in 0..ID_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            if sessions.contains_key(&id) {
                continue;
            }
            let session = ChatSession::new(id.clone(), user_id, self.config.default_model.clone());
            sessions.insert(id.clone(), Arc::new(Mutex::new(SessionEntry::new(session.clone()))));
            tracing::debug!(session_id = %id, user_id = %user_id, "Session created");
            return Ok(session);
        }

        tracing::error!(user_id = %user_id, "Session id space exhausted");
        Err(SessionError::IdExhausted)
    }

    /// Resume `session_id` for `user_id` or start a new session.
    ///
    /// An existing session owned by someone else is an error, never a new
    /// session. A session past its grace window, or already ended, is left
    /// for the sweep and a fresh one is returned.
    pub fn get_or_create_session(
        &self,
        session_id: Option<&str>,
        user_id: &str,
    ) -> Result<ResolvedSession, SessionError> {
        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
            let sessions = self.sessions.read();
            if let Some(entry) = sessions.get(id) {
                let entry = entry.lock();
                if !entry.session.is_owned_by(user_id) {
                    tracing::warn!(
                        session_id = %id,
                        user_id = %user_id,
                        "Rejected access to another user's session"
                    );
                    return Err(SessionError::OwnershipViolation);
                }
                if entry.resumable(Instant::now(), self.config.reconnect_grace) {
                    return Ok(ResolvedSession {
                        session: entry.session.clone(),
                        created: false,
                    });
                }
                tracing::debug!(session_id = %id, "Session past grace window, starting fresh");
            }
        }

        let session = self.create_session(user_id)?;
        Ok(ResolvedSession {
            session,
            created: true,
        })
    }

    /// Snapshot of a session.
    pub fn get(&self, session_id: &str) -> Option<ChatSession> {
        let sessions = self.sessions.read();
        sessions.get(session_id).map(|entry| entry.lock().session.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Mark a session inactive. Ending an ended session is a no-op; returns
    /// whether this call ended it.
    pub fn end_session(&self, session_id: &str) -> Result<bool, SessionError> {
        self.with_entry(session_id, |entry| {
            let ended = entry.session.end(Utc::now());
            if ended {
                entry.last_activity = Instant::now();
                tracing::debug!(session_id = %session_id, "Session ended");
            }
            Ok(ended)
        })
    }

    /// Append a message and advance the session's activity clock.
    pub fn record_message(
        &self,
        session_id: &str,
        message: StoredMessage,
    ) -> Result<ChatSession, SessionError> {
        self.with_entry(session_id, |entry| {
            entry.session.push_message(message);
            entry.touch();
            Ok(entry.session.clone())
        })
    }

    pub fn set_model(&self, session_id: &str, model_id: &str) -> Result<ChatSession, SessionError> {
        self.with_entry(session_id, |entry| {
            entry.session.model_id = model_id.to_string();
            entry.touch();
            Ok(entry.session.clone())
        })
    }

    pub fn mark_help_requested(&self, session_id: &str) -> Result<ChatSession, SessionError> {
        self.with_entry(session_id, |entry| {
            entry.session.help_requested = true;
            entry.touch();
            Ok(entry.session.clone())
        })
    }

    /// Check-and-set admin assistance. At most one administrator wins.
    pub fn set_admin_assistance(
        &self,
        session_id: &str,
        admin_id: &str,
        admin_name: &str,
    ) -> Result<ChatSession, SessionError> {
        self.with_entry(session_id, |entry| {
            if !entry.session.assign_admin(admin_id, admin_name) {
                return Err(SessionError::AlreadyAssisted {
                    admin_id: entry.session.assisting_admin_id.clone().unwrap_or_default(),
                });
            }
            entry.touch();
            Ok(entry.session.clone())
        })
    }

    /// Release admin assistance held by `admin_id`.
    pub fn clear_admin_assistance(
        &self,
        session_id: &str,
        admin_id: &str,
    ) -> Result<ChatSession, SessionError> {
        self.with_entry(session_id, |entry| {
            if !entry.session.release_admin(admin_id) {
                return Err(SessionError::NotAssisting);
            }
            entry.touch();
            Ok(entry.session.clone())
        })
    }

    /// Account one completed model turn.
    pub fn record_turn_metrics(
        &self,
        session_id: &str,
        elapsed: Duration,
        tokens: u64,
    ) -> Result<ChatSession, SessionError> {
        self.with_entry(session_id, |entry| {
            entry.session.record_response_time(elapsed);
            entry.session.total_tokens = entry.session.total_tokens.saturating_add(tokens);
            Ok(entry.session.clone())
        })
    }

    /// Note that a live connection is using the session. Attached active
    /// sessions are never swept.
    pub fn attach_connection(&self, session_id: &str) -> Result<(), SessionError> {
        self.with_entry(session_id, |entry| {
            entry.attached += 1;
            entry.touch();
            Ok(())
        })
    }

    /// Undo [`attach_connection`](Self::attach_connection). The grace window
    /// starts from the last detach.
    pub fn detach_connection(&self, session_id: &str) -> Result<(), SessionError> {
        self.with_entry(session_id, |entry| {
            entry.attached = entry.attached.saturating_sub(1);
            entry.last_activity = Instant::now();
            Ok(())
        })
    }

    /// Remove sessions idle beyond the TTL, sparing active sessions that
    /// still have a connection attached. Returns the removed sessions.
    pub fn sweep(&self) -> Vec<ChatSession> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut removed = Vec::new();

        let mut sessions = self.sessions.write();
        sessions.retain(|_, entry| {
            let mut entry = entry.lock();
            if entry.sweepable(now, ttl) {
                entry.session.end(Utc::now());
                removed.push(entry.session.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Seed the registry with sessions loaded from storage. Ids already
    /// present are skipped. Returns how many were inserted.
    pub fn rehydrate(&self, stored: Vec<ChatSession>) -> usize {
        let mut sessions = self.sessions.write();
        let mut inserted = 0;
        for session in stored {
            if sessions.contains_key(&session.id) {
                continue;
            }
            let idle = (Utc::now() - session.last_activity).to_std().unwrap_or_default();
            let mut entry = SessionEntry::new(session);
            entry.last_activity = Instant::now().checked_sub(idle).unwrap_or_else(Instant::now);
            sessions.insert(entry.session.id.clone(), Arc::new(Mutex::new(entry)));
            inserted += 1;
        }
        inserted
    }

    /// Every session, newest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|entry| entry.lock().session.summary())
            .collect();
        sort_newest_first(&mut summaries);
        summaries
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read();
        let mut stats = RegistryStats {
            total: sessions.len(),
            ..RegistryStats::default()
        };
        for entry in sessions.values() {
            let entry = entry.lock();
            if entry.session.is_active {
                stats.active += 1;
            } else {
                stats.inactive += 1;
            }
            if entry.session.admin_assisted {
                stats.admin_assisted += 1;
            }
            stats.attached_connections += entry.attached;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sweep task. Safe to call any number of times.
    pub async fn stop(&self) {
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!("Session sweep stopped");
        }
    }

    fn with_entry<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionEntry) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let sessions = self.sessions.read();
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let mut entry = entry.lock();
        f(&mut entry)
    }
}
