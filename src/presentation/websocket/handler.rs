//! WebSocket Connection Handler
//!
//! Authenticates the upgrade, then drives one socket with three tasks. The
//! read pump keeps reading while frames are being handled and queues them
//! for the dispatcher, which hands them to the router one at a time in
//! arrival order. The write pump drains the connection's outbound queue and
//! keeps the peer alive with pings. Any of them stopping cancels the others,
//! and any in-flight model turn, through the connection's token.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};

use super::connection::{CloseReason, Connection};
use super::messages::WireMessage;
use super::router::MessageRouter;
use crate::config::WebSocketSettings;
use crate::infrastructure::metrics;
use crate::presentation::middleware::auth::{bearer_token, AuthError};
use crate::presentation::middleware::{is_origin_allowed, AuthUser};
use crate::shared::error::{AppError, ChatError, ErrorCode};
use crate::startup::AppState;

/// Upper bound for flushing queued frames and the close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Inbound frames waiting for the dispatcher.
const INBOUND_QUEUE: usize = 32;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Legacy credential transport for clients that cannot set headers
    token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Origin and credentials are checked before the upgrade so rejected
/// clients get a plain HTTP error.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !is_origin_allowed(&state.settings.cors, origin) {
        tracing::warn!(origin = ?origin, "WebSocket upgrade from disallowed origin");
        return Err(AppError::Forbidden("Origin not allowed".into()));
    }

    let token = match bearer_token(&headers) {
        Some(token) => token.to_string(),
        None => match params.token.filter(|t| !t.is_empty()) {
            Some(token) => {
                tracing::debug!("Token passed in query string, prefer the Authorization header");
                token
            }
            None => return Err(AuthError::MissingToken.into()),
        },
    };

    let user = state.jwt.verify(&token)?;
    tracing::debug!(user_id = %user.user_id, "WebSocket upgrade authorized");

    let limit = state.settings.websocket.max_message_size;
    Ok(ws
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, user)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser) {
    let settings = state.settings.websocket.clone();
    let (conn, outbound) = state.connections.new_connection(user);

    // Split socket for concurrent read/write
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(conn.clone(), sink, outbound, settings.clone()));

    if let Err(e) = state.connections.register(conn.clone()) {
        tracing::info!(
            connection_id = %conn.id(),
            user_id = %conn.user_id(),
            error = %e,
            "Connection refused"
        );
        conn.begin_close(CloseReason::ConnectionLimit);
        let _ = writer.await;
        conn.mark_closed();
        return;
    }

    tracing::info!(
        connection_id = %conn.id(),
        user_id = %conn.user_id(),
        admin = conn.is_admin(),
        "WebSocket connected"
    );

    let welcome = WireMessage::status(None, "connected");
    if let Err(e) = conn.send_message(&welcome) {
        tracing::debug!(connection_id = %conn.id(), error = %e, "Welcome dropped");
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let dispatcher = tokio::spawn(dispatch_frames(conn.clone(), state.router.clone(), inbound_rx));

    read_pump(&conn, stream, inbound_tx, settings.idle_timeout()).await;

    // Cleanup. Closing cancels a model turn still running in the dispatcher.
    conn.begin_close(CloseReason::ClientClosed);
    let grace = settings.write_timeout() + CLOSE_FLUSH_TIMEOUT;
    join_or_abort(&conn, "Dispatcher", dispatcher, grace).await;

    state.router.connection_closed(&conn);
    state.connections.unregister(conn.id());

    join_or_abort(&conn, "Writer", writer, grace).await;
    conn.mark_closed();

    tracing::info!(
        connection_id = %conn.id(),
        user_id = %conn.user_id(),
        reason = conn.close_reason().map(|r| r.description()).unwrap_or("closed"),
        connected_secs = (chrono::Utc::now() - conn.connected_at()).num_seconds(),
        "WebSocket disconnected"
    );
}

/// Wait for a connection task to finish, aborting it after `grace`.
async fn join_or_abort(
    conn: &Connection,
    task: &'static str,
    mut handle: tokio::task::JoinHandle<()>,
    grace: Duration,
) {
    if timeout(grace, &mut handle).await.is_err() {
        tracing::warn!(connection_id = %conn.id(), task, "Task did not stop, aborting");
        handle.abort();
    }
}

/// Read frames until the peer leaves, the connection idles out or it is
/// closed from elsewhere. Never waits on frame handling, so a close or a
/// dropped peer is seen while a model turn is still running.
async fn read_pump(
    conn: &Arc<Connection>,
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Utf8Bytes>,
    idle_timeout: Duration,
) {
    let cancel = conn.cancellation().clone();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = timeout(idle_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                tracing::debug!(connection_id = %conn.id(), "Idle timeout");
                conn.begin_close(CloseReason::IdleTimeout);
                return;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                conn.begin_close(CloseReason::ClientClosed);
                return;
            }
            Ok(Some(Err(e))) => {
                // Includes frames over the configured size limit
                tracing::debug!(connection_id = %conn.id(), error = %e, "Read failed");
                conn.begin_close(CloseReason::ProtocolError);
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match inbound.try_send(text) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(connection_id = %conn.id(), "Inbound queue full, frame rejected");
                    reply_error(conn, ChatError::rate_limited(1));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            },
            Message::Binary(_) => {
                let error = ChatError::validation(ErrorCode::InvalidFormat, "binary frames are not supported");
                reply_error(conn, error);
            }
            // Pings are answered by the protocol layer
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) => {}
        }
    }
}

/// Hand queued frames to the router one at a time. Frames still queued when
/// the connection starts closing are dropped.
async fn dispatch_frames(
    conn: Arc<Connection>,
    router: Arc<MessageRouter>,
    mut inbound: mpsc::Receiver<Utf8Bytes>,
) {
    let cancel = conn.cancellation().clone();

    loop {
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            text = inbound.recv() => match text {
                Some(text) => text,
                None => return,
            },
        };
        router.handle_frame(&conn, text.as_str()).await;
    }
}

/// Error frame for a frame rejected before it reached the router.
fn reply_error(conn: &Connection, error: ChatError) {
    metrics::record_chat_error(error.code.as_str());
    let session_id = conn.session_id();
    if let Err(e) = conn.send_message(&WireMessage::error(session_id.as_deref(), &error)) {
        tracing::debug!(connection_id = %conn.id(), error = %e, "Reply dropped");
    }
}

/// Forward queued frames to the socket and ping on a fixed period.
async fn write_pump(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    settings: WebSocketSettings,
) {
    let cancel = conn.cancellation().clone();
    let write_timeout = settings.write_timeout();
    let period = settings.ping_interval();
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Default::default()),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Write failed");
                conn.begin_close(CloseReason::WriteFailed);
                return;
            }
            Err(_) => {
                tracing::debug!(connection_id = %conn.id(), "Write timed out");
                conn.begin_close(CloseReason::WriteFailed);
                return;
            }
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
    let flush = async {
        // Frames queued before the close still go out, the error frame
        // explaining a refusal included
        while let Ok(frame) = outbound.try_recv() {
            if sink.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
        if reason.sends_close_frame() {
            let frame = CloseFrame {
                code: reason.code(),
                reason: reason.description().into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }
        let _ = sink.close().await;
    };

    if timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
        tracing::debug!(connection_id = %conn.id(), "Close flush timed out");
    }
}
