//! WebSocket Gateway Tests
//!
//! End-to-end tests against a bound server with a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};
use tokio_tungstenite::connect_async;

use chatbox_server::domain::{ChunkStream, CompletionRequest, LlmError, LlmProvider};

use crate::common::{TestApp, TestUser};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connect with a bearer token and consume the `connected` status frame.
async fn connect(app: &TestApp, token: &str) -> WsStream {
    let mut request = app.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", token).parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    let hello = read_json(&mut ws).await;
    assert_eq!(hello["type"], "connection_status");
    assert_eq!(hello["content"], "connected");
    ws
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read until the final (non-streaming) frame of the given type.
async fn read_final(ws: &mut WsStream, message_type: &str) -> Value {
    loop {
        let frame = read_json(ws).await;
        if frame["type"] == message_type && frame["metadata"]["streaming"] != "true" {
            return frame;
        }
    }
}

/// Wait for the server to close the socket, returning the close code if a
/// close frame was sent.
async fn read_close(ws: &mut WsStream) -> Option<u16> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("timeout waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Model that never answers and reports when its call is cancelled.
struct StalledProvider {
    cancelled: Mutex<Option<oneshot::Sender<()>>>,
}

impl StalledProvider {
    fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let provider = Arc::new(Self {
            cancelled: Mutex::new(Some(tx)),
        });
        (provider, rx)
    }
}

#[async_trait]
impl LlmProvider for StalledProvider {
    async fn stream(
        &self,
        _request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let notify = self.cancelled.lock().take();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(tx) = notify {
                let _ = tx.send(());
            }
        });
        Ok(futures::stream::pending::<Result<String, LlmError>>().boxed())
    }
}

/// Poll until `check` holds or the test timeout passes.
async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_upgrade_requires_token() {
    let app = TestApp::new().await;

    let err = connect_async(app.ws_url()).await.unwrap_err();

    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_upgrade_with_query_token() {
    let app = TestApp::new().await;
    let user = TestUser::user();

    let url = format!("{}?token={}", app.ws_url(), user.token);
    let (mut ws, _) = connect_async(url).await.unwrap();

    assert_eq!(read_json(&mut ws).await["content"], "connected");
}

#[tokio::test]
async fn test_disallowed_origin_rejected() {
    let app = TestApp::with_settings(|s| {
        s.cors.allowed_origins = vec!["https://app.example".into()];
    })
    .await;
    let user = TestUser::user();

    let mut request = app.ws_url().into_client_request().unwrap();
    let headers = request.headers_mut();
    headers.insert("Authorization", format!("Bearer {}", user.token).parse().unwrap());
    headers.insert("Origin", "https://evil.example".parse().unwrap());

    match connect_async(request).await.unwrap_err() {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 403),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_message_gets_streamed_reply() {
    let app = TestApp::new().await;
    let user = TestUser::user();
    let mut ws = connect(&app, &user.token).await;

    send_json(&mut ws, json!({"type": "user_message", "content": "hello there"})).await;

    let loading = read_json(&mut ws).await;
    assert_eq!(loading["type"], "loading");
    let session_id = loading["session_id"].as_str().unwrap().to_string();

    let reply = read_final(&mut ws, "ai_response").await;
    assert_eq!(reply["session_id"], session_id.as_str());
    assert_eq!(reply["sender"], "ai");
    assert_eq!(reply["content"], "[gpt-4] You said: hello there");

    let session = app.state.sessions.get(&session_id).unwrap();
    assert_eq!(session.user_id, user.user_id);
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn test_invalid_frame_keeps_connection_open() {
    let app = TestApp::new().await;
    let user = TestUser::user();
    let mut ws = connect(&app, &user.token).await;

    ws.send(Message::text("not json")).await.unwrap();
    let error = read_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["code"], "INVALID_FORMAT");
    assert_eq!(error["error"]["recoverable"], true);

    send_json(&mut ws, json!({"type": "model_select", "model_id": "claude-3"})).await;
    let ack = read_json(&mut ws).await;
    assert_eq!(ack["content"], "Model changed to claude-3");
}

#[tokio::test]
async fn test_binary_frame_rejected_with_session() {
    let app = TestApp::new().await;
    let user = TestUser::user();
    let mut ws = connect(&app, &user.token).await;

    send_json(&mut ws, json!({"type": "model_select", "model_id": "claude-3"})).await;
    let ack = read_json(&mut ws).await;
    let session_id = ack["session_id"].as_str().unwrap().to_string();

    ws.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();
    let error = read_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["code"], "INVALID_FORMAT");
    assert_eq!(error["error"]["recoverable"], true);
    assert_eq!(error["session_id"], session_id.as_str());

    // Still usable afterwards
    send_json(&mut ws, json!({"type": "model_select", "model_id": "gpt-4"})).await;
    assert_eq!(read_json(&mut ws).await["content"], "Model changed to gpt-4");
}

#[tokio::test]
async fn test_disconnect_cancels_model_turn() {
    let (provider, cancelled) = StalledProvider::new();
    let app = TestApp::with_llm(provider).await;
    let user = TestUser::user();
    let mut ws = connect(&app, &user.token).await;

    send_json(&mut ws, json!({"type": "user_message", "content": "are you there?"})).await;
    let loading = read_json(&mut ws).await;
    assert_eq!(loading["type"], "loading");

    ws.close(None).await.unwrap();
    drop(ws);

    timeout(TIMEOUT, cancelled)
        .await
        .expect("model call was not cancelled")
        .unwrap();
    assert!(eventually(|| app.state.connections.count() == 0).await);
    assert!(eventually(|| app.state.sessions.stats().attached_connections == 0).await);
}

#[tokio::test]
async fn test_reply_reaches_all_devices() {
    let app = TestApp::new().await;
    let user = TestUser::user();
    let mut phone = connect(&app, &user.token).await;
    let mut laptop = connect(&app, &user.token).await;

    send_json(&mut phone, json!({"type": "user_message", "content": "sync"})).await;

    let on_phone = read_final(&mut phone, "ai_response").await;
    let on_laptop = read_final(&mut laptop, "ai_response").await;
    assert_eq!(on_phone["content"], on_laptop["content"]);
    assert_eq!(on_phone["session_id"], on_laptop["session_id"]);
}

#[tokio::test]
async fn test_reconnect_resumes_session() {
    let app = TestApp::new().await;
    let user = TestUser::user();

    let mut ws = connect(&app, &user.token).await;
    send_json(&mut ws, json!({"type": "user_message", "content": "first"})).await;
    let reply = read_final(&mut ws, "ai_response").await;
    let session_id = reply["session_id"].as_str().unwrap().to_string();
    ws.close(None).await.unwrap();

    let mut ws = connect(&app, &user.token).await;
    send_json(
        &mut ws,
        json!({"type": "user_message", "session_id": session_id, "content": "second"}),
    )
    .await;
    let reply = read_final(&mut ws, "ai_response").await;

    assert_eq!(reply["session_id"], session_id.as_str());
    assert_eq!(app.state.sessions.get(&session_id).unwrap().messages.len(), 4);
}

#[tokio::test]
async fn test_foreign_session_rejected() {
    let app = TestApp::new().await;
    let owner = TestUser::user();
    let intruder = TestUser::user();
    let session = app.state.sessions.create_session(&owner.user_id).unwrap();

    let mut ws = connect(&app, &intruder.token).await;
    send_json(
        &mut ws,
        json!({"type": "user_message", "session_id": session.id, "content": "peek"}),
    )
    .await;

    let error = read_json(&mut ws).await;
    assert_eq!(error["error"]["code"], "FORBIDDEN");
    assert!(app.state.sessions.get(&session.id).unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_oversized_frame_closes_only_that_connection() {
    let app = TestApp::with_settings(|s| s.websocket.max_message_size = 1024).await;
    let user = TestUser::user();
    let mut big = connect(&app, &user.token).await;
    let mut other = connect(&app, &user.token).await;

    let content = "x".repeat(4096);
    let _ = big
        .send(Message::text(json!({"type": "user_message", "content": content}).to_string()))
        .await;
    let code = read_close(&mut big).await;
    assert!(code.is_none() || code == Some(1002) || code == Some(1009));

    send_json(&mut other, json!({"type": "user_message", "content": "still here"})).await;
    let reply = read_final(&mut other, "ai_response").await;
    assert_eq!(reply["content"], "[gpt-4] You said: still here");
}

#[tokio::test]
async fn test_connection_limit_per_user() {
    let app = TestApp::with_settings(|s| s.websocket.max_connections_per_user = 1).await;
    let user = TestUser::user();
    let _first = connect(&app, &user.token).await;

    let mut request = app.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", user.token).parse().unwrap());
    let (mut second, _) = connect_async(request).await.unwrap();

    assert_eq!(read_close(&mut second).await, Some(1008));
    assert_eq!(app.state.connections.connections_for_user(&user.user_id).len(), 1);
}

#[tokio::test]
async fn test_admin_takeover_over_websocket() {
    let app = TestApp::new().await;
    let user = TestUser::user();
    let admin = TestUser::admin();
    let mut user_ws = connect(&app, &user.token).await;
    let mut admin_ws = connect(&app, &admin.token).await;

    send_json(&mut user_ws, json!({"type": "help_request"})).await;
    let ack = read_json(&mut user_ws).await;
    let session_id = ack["session_id"].as_str().unwrap().to_string();

    send_json(&mut admin_ws, json!({"type": "admin_takeover", "session_id": session_id})).await;

    let joined = read_json(&mut user_ws).await;
    assert_eq!(joined["type"], "admin_takeover");
    assert_eq!(joined["metadata"]["admin_id"], admin.user_id.as_str());
    let admin_ack = read_json(&mut admin_ws).await;
    assert_eq!(admin_ack["type"], "connection_status");

    // The owner's next message goes to the admin instead of the model
    send_json(
        &mut user_ws,
        json!({"type": "user_message", "session_id": session_id, "content": "are you there?"}),
    )
    .await;
    let relayed = read_json(&mut admin_ws).await;
    assert_eq!(relayed["content"], "are you there?");

    send_json(
        &mut admin_ws,
        json!({"type": "user_message", "session_id": session_id, "content": "yes"}),
    )
    .await;
    let answer = read_json(&mut user_ws).await;
    assert_eq!(answer["sender"], "admin");
    assert_eq!(answer["content"], "yes");
}

#[tokio::test]
async fn test_takeover_requires_admin_role() {
    let app = TestApp::new().await;
    let owner = TestUser::user();
    let other = TestUser::user();
    let session = app.state.sessions.create_session(&owner.user_id).unwrap();

    let mut ws = connect(&app, &other.token).await;
    send_json(&mut ws, json!({"type": "admin_takeover", "session_id": session.id})).await;

    let error = read_json(&mut ws).await;
    assert_eq!(error["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_message_rate_limit() {
    let app = TestApp::with_settings(|s| s.rate_limit.message_limit = 1).await;
    let user = TestUser::user();
    let mut ws = connect(&app, &user.token).await;

    send_json(&mut ws, json!({"type": "model_select", "model_id": "m1"})).await;
    read_json(&mut ws).await;
    send_json(&mut ws, json!({"type": "model_select", "model_id": "m2"})).await;

    let error = read_json(&mut ws).await;
    assert_eq!(error["error"]["code"], "TOO_MANY_REQUESTS");
    assert!(error["error"]["retry_after"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_graceful_shutdown_closes_sockets() {
    let mut app = TestApp::new().await;
    let user = TestUser::user();
    let mut ws = connect(&app, &user.token).await;

    app.stop().await;

    assert_eq!(read_close(&mut ws).await, Some(1001));
    assert_eq!(app.state.connections.count(), 0);
}
