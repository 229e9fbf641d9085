//! One live client socket.
//!
//! A `Connection` is the handle the rest of the server holds for a socket.
//! The socket halves themselves stay inside the handler's read and write
//! pumps; everyone else talks to the client through the bounded outbound
//! queue and observes or drives the lifecycle through the accessors here.

use axum::extract::ws::{close_code, CloseCode, Utf8Bytes};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::messages::WireMessage;
use crate::presentation::middleware::auth::AuthUser;

/// Connection lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or went away
    ClientClosed,
    /// Server shutdown
    GoingAway,
    IdleTimeout,
    /// Read error, including frames over the size limit
    ProtocolError,
    /// Outbound queue overflowed
    SlowConsumer,
    WriteFailed,
    ConnectionLimit,
}

impl CloseReason {
    pub fn code(&self) -> CloseCode {
        match self {
            Self::ClientClosed => close_code::NORMAL,
            Self::GoingAway => close_code::AWAY,
            Self::IdleTimeout => close_code::NORMAL,
            Self::ProtocolError => close_code::PROTOCOL,
            Self::SlowConsumer => close_code::AGAIN,
            Self::WriteFailed => close_code::ERROR,
            Self::ConnectionLimit => close_code::POLICY,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ClientClosed => "closed",
            Self::GoingAway => "server shutting down",
            Self::IdleTimeout => "idle timeout",
            Self::ProtocolError => "protocol error",
            Self::SlowConsumer => "client too slow",
            Self::WriteFailed => "write failed",
            Self::ConnectionLimit => "connection limit exceeded",
        }
    }

    /// Whether a close frame is still worth sending.
    pub fn sends_close_frame(&self) -> bool {
        !matches!(self, Self::WriteFailed | Self::ClientClosed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("outbound queue is full")]
    Backpressure,

    #[error("user already has {limit} open connections")]
    LimitExceeded { limit: usize },

    #[error("shutdown deadline exceeded with {} connections still open", remaining.len())]
    DeadlineExceeded { remaining: Vec<String> },

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

struct ConnectionInner {
    session_id: Option<String>,
    close_reason: Option<CloseReason>,
}

pub struct Connection {
    id: String,
    user: AuthUser,
    connected_at: DateTime<Utc>,
    inner: Mutex<ConnectionInner>,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Sender<Utf8Bytes>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection for a verified user. The receiver feeds the
    /// socket's write pump; `cancel` fires when the connection starts
    /// closing.
    pub fn new(
        id: String,
        user: AuthUser,
        outbound_capacity: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Authenticated);

        let connection = Arc::new(Self {
            id,
            user,
            connected_at: Utc::now(),
            inner: Mutex::new(ConnectionInner {
                session_id: None,
                close_reason: None,
            }),
            state,
            outbound: tx,
            cancel,
        });

        (connection, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &AuthUser {
        &self.user
    }

    pub fn user_id(&self) -> &str {
        &self.user.user_id
    }

    pub fn name(&self) -> &str {
        &self.user.name
    }

    pub fn is_admin(&self) -> bool {
        self.user.is_admin()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().session_id.clone()
    }

    /// Attach a session, returning the previously attached one.
    pub fn set_session_id(&self, session_id: &str) -> Option<String> {
        self.inner.lock().session_id.replace(session_id.to_string())
    }

    /// Detach from the current session, returning it.
    pub fn take_session_id(&self) -> Option<String> {
        self.inner.lock().session_id.take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() < ConnectionState::Closing
    }

    /// Move to `next` if it is later in the lifecycle. Returns whether the
    /// state changed.
    pub fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Queue an encoded frame without waiting.
    pub fn send(&self, frame: Utf8Bytes) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    pub fn send_message(&self, message: &WireMessage) -> Result<(), ConnectionError> {
        let text = message
            .to_json()
            .map_err(|e| ConnectionError::Encode(e.to_string()))?;
        self.send(text.into())
    }

    /// Start closing. The first reason wins; later calls only make sure the
    /// pumps have been told to stop.
    pub fn begin_close(&self, reason: CloseReason) {
        {
            let mut inner = self.inner.lock();
            if inner.close_reason.is_none() {
                inner.close_reason = Some(reason);
            }
        }
        self.transition(ConnectionState::Closing);
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason
    }

    /// Token cancelled once the connection starts closing. In-flight work
    /// for this connection runs under child tokens of it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Final state, set once the socket is gone and the connection has left
    /// every index.
    pub fn mark_closed(&self) {
        self.cancel.cancel();
        self.transition(ConnectionState::Closed);
    }

    /// Resolves once the connection reaches [`ConnectionState::Closed`].
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user.user_id)
            .field("state", &self.state())
            .finish()
    }
}
