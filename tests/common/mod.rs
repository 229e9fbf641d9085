//! Common Test Utilities
//!
//! Shared helpers, fixtures, and test infrastructure.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{body::Body, http::Request, Router};
use fake::{faker::name::en::Name, Fake};
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use chatbox_server::config::Settings;
use chatbox_server::domain::LlmProvider;
use chatbox_server::infrastructure::{EchoLlmProvider, InMemorySessionStore, LogNotifier};
use chatbox_server::presentation::http::create_router;
use chatbox_server::presentation::websocket::Collaborators;
use chatbox_server::startup::{AppState, Application};

pub const TEST_SECRET: &str = "q8Zr2vN4kLw9XyT1mPb7Hc3Jd6Fg0Su5";

/// Settings for a server bound to an ephemeral local port
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    settings.server.shutdown_timeout_secs = 2;
    settings.jwt.secret = TEST_SECRET.into();
    settings
}

/// Test user with a signed token
#[derive(Debug, Clone)]
pub struct TestUser {
    pub user_id: String,
    pub name: String,
    pub token: String,
}

impl TestUser {
    pub fn new(roles: &[&str]) -> Self {
        let user_id = format!("user-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let name: String = Name().fake();
        let token = sign_token(&user_id, &name, roles);
        Self {
            user_id,
            name,
            token,
        }
    }

    pub fn user() -> Self {
        Self::new(&["user"])
    }

    pub fn admin() -> Self {
        Self::new(&["admin"])
    }
}

pub fn sign_token(user_id: &str, name: &str, roles: &[&str]) -> String {
    let claims = serde_json::json!({
        "user_id": user_id,
        "name": name,
        "roles": roles,
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// A running server plus a router over the same state for in-process
/// requests.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = test_settings();
        configure(&mut settings);
        Self::spawn(settings, Arc::new(EchoLlmProvider::new())).await
    }

    /// Run against a custom model provider
    pub async fn with_llm(llm: Arc<dyn LlmProvider>) -> Self {
        Self::spawn(test_settings(), llm).await
    }

    async fn spawn(settings: Settings, llm: Arc<dyn LlmProvider>) -> Self {
        let services = Collaborators {
            store: Arc::new(InMemorySessionStore::new()),
            llm,
            notifier: Arc::new(LogNotifier),
        };
        let app = Application::build_with(settings, services)
            .await
            .expect("failed to build application");

        let addr = app.local_addr().unwrap();
        let state = app.state().clone();
        let router = create_router(state.clone());

        let (tx, rx) = oneshot::channel();
        let server = tokio::spawn(app.run_until(async move {
            let _ = rx.await;
        }));

        Self {
            router,
            state,
            addr,
            shutdown: Some(tx),
            server: Some(server),
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Trigger graceful shutdown and wait for the server to finish
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.unwrap().unwrap();
        }
    }

    /// Make a GET request to the application
    pub async fn get(&self, uri: &str) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    /// Make an authenticated GET request
    pub async fn get_auth(&self, uri: &str, token: &str) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }
}

/// Read a response body as JSON
pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
