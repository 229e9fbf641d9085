//! # Chatbox Server
//!
//! Real-time chat backend: WebSocket conversations with a streaming model,
//! per-user sessions that survive reconnects, and live admin takeover.
//!
//! This is the application entry point that initializes:
//! - Tracing/logging subsystem
//! - Configuration loading
//! - HTTP/WebSocket server with graceful shutdown

use anyhow::Result;
use tracing::info;

use chatbox_server::config::Settings;
use chatbox_server::startup::Application;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for structured logging
    chatbox_server::telemetry::init_tracing();

    info!("Starting Chatbox Server...");

    // Load configuration from environment and config files
    let settings = Settings::load()?;
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        environment = %settings.environment,
        "Configuration loaded"
    );

    // Build and run the application
    let application = Application::build(settings).await?;

    info!("Server ready to accept connections");
    application.run_until_stopped().await?;

    Ok(())
}
