//! Application Startup
//!
//! Application building and server initialization.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;

use crate::application::services::{RateLimiters, RegistryConfig, SessionRegistry};
use crate::config::Settings;
use crate::domain::{ChatSession, SessionStore};
use crate::infrastructure::{EchoLlmProvider, InMemorySessionStore, LogNotifier};
use crate::presentation::http::{create_router, handlers::health};
use crate::presentation::middleware::JwtVerifier;
use crate::presentation::websocket::{Collaborators, ConnectionManager, MessageRouter, RouterConfig};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt: Arc<JwtVerifier>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub router: Arc<MessageRouter>,
    pub limiters: RateLimiters,
    pub store: Arc<dyn SessionStore>,
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
    state: AppState,
}

impl Application {
    /// Build the application with the built-in collaborators: in-memory
    /// storage, the echo model and log-only notifications.
    pub async fn build(settings: Settings) -> Result<Self> {
        let services = Collaborators {
            store: Arc::new(InMemorySessionStore::new()),
            llm: Arc::new(EchoLlmProvider::new()),
            notifier: Arc::new(LogNotifier),
        };
        Self::build_with(settings, services).await
    }

    /// Build the application around the given collaborators
    pub async fn build_with(settings: Settings, services: Collaborators) -> Result<Self> {
        settings.validate()?;
        health::init_server_start();

        if settings.cors.allowed_origins.is_empty() {
            tracing::warn!("No allowed origins configured, accepting every origin");
        }

        let jwt = Arc::new(JwtVerifier::new(&settings.jwt.secret));
        let limiters = RateLimiters::start(&settings.rate_limit);

        let store = services.store.clone();
        let sessions = SessionRegistry::start_with_hook(
            RegistryConfig::from_settings(&settings),
            persist_expired(store.clone(), settings.storage.timeout()),
        );
        rehydrate(&sessions, store.as_ref()).await;

        let connections = Arc::new(ConnectionManager::from_settings(&settings.websocket));
        let router = Arc::new(MessageRouter::new(
            sessions.clone(),
            connections.clone(),
            limiters.clone(),
            services,
            RouterConfig::from_settings(&settings),
        ));

        let state = AppState {
            settings: Arc::new(settings.clone()),
            jwt,
            sessions,
            connections,
            router,
            limiters,
            store,
        };

        let router = create_router(state.clone());

        // Bind to address
        let listener = TcpListener::bind(settings.server_addr()).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            router,
            state,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the server until Ctrl-C or SIGTERM
    pub async fn run_until_stopped(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server until `signal` resolves, then close every socket
    /// within the configured deadline and stop the background tasks.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state;
        let connections = state.connections.clone();
        let deadline = state.settings.server.shutdown_timeout();

        let graceful = async move {
            signal.await;
            tracing::info!("Shutdown signal received, closing connections");
            if let Err(e) = connections.shutdown_with_deadline(deadline).await {
                tracing::warn!(error = %e, "Connections left open at shutdown");
            }
        };

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful)
        .await?;

        state.sessions.stop().await;
        state.limiters.stop().await;
        tracing::info!("Server stopped");
        Ok(())
    }
}

/// Fill the registry from the store. Failures are logged and startup
/// continues with an empty registry.
async fn rehydrate(sessions: &SessionRegistry, store: &dyn SessionStore) {
    match store.load_active_sessions().await {
        Ok(stored) => {
            let restored = sessions.rehydrate(stored);
            if restored > 0 {
                tracing::info!(restored, "Sessions restored from storage");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to restore sessions from storage"),
    }
}

/// Sweep hook writing the end of every expired session to the store.
fn persist_expired(
    store: Arc<dyn SessionStore>,
    timeout: std::time::Duration,
) -> impl Fn(Vec<ChatSession>) + Send + 'static {
    move |expired| {
        let store = store.clone();
        tokio::spawn(async move {
            for session in expired {
                let ended_at = session.end_time.unwrap_or_else(chrono::Utc::now);
                match tokio::time::timeout(timeout, store.end_session(&session.id, ended_at)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(session_id = %session.id, error = %e, "Failed to persist expired session")
                    }
                    Err(_) => {
                        tracing::warn!(session_id = %session.id, "Persisting expired session timed out")
                    }
                }
            }
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
