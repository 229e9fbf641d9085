//! Application settings and configuration structures.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration (host, port, prefix)
    pub server: ServerSettings,

    /// JWT authentication settings
    pub jwt: JwtSettings,

    /// Rate limiting configuration
    pub rate_limit: RateLimitSettings,

    /// Session registry configuration
    pub session: SessionSettings,

    /// WebSocket configuration
    pub websocket: WebSocketSettings,

    /// LLM collaborator configuration
    pub llm: LlmSettings,

    /// Storage collaborator configuration
    pub storage: StorageSettings,

    /// CORS configuration
    pub cors: CorsSettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Server binding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,

    /// Port number to listen on
    pub port: u16,

    /// Prefix every route is mounted under (empty mounts at root)
    pub path_prefix: String,

    /// Upper bound for closing live connections on shutdown
    pub shutdown_timeout_secs: u64,
}

/// JWT authentication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    /// HMAC secret used to verify tokens
    pub secret: String,
}

/// Rate limiting configuration.
///
/// Each concern gets its own limiter so exhausting one never affects another.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Inbound chat messages allowed per user per window
    pub message_limit: usize,
    pub message_window_secs: u64,

    /// Administrative requests allowed per admin per window
    pub admin_limit: usize,
    pub admin_window_secs: u64,

    /// Public endpoint requests allowed per client address per window
    pub public_limit: usize,
    pub public_window_secs: u64,

    /// How often empty buckets are evicted
    pub cleanup_interval_secs: u64,

    /// Honor X-Forwarded-For / X-Real-IP when keying by address.
    /// Only enable behind a trusted reverse proxy.
    pub trust_proxy_headers: bool,
}

/// Session registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Window after the last activity during which a session can be resumed
    pub reconnect_grace_secs: u64,

    /// Idle time after which the sweep drops a session
    pub ttl_secs: u64,

    /// Sweep period
    pub cleanup_interval_secs: u64,
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSettings {
    /// Maximum inbound message size in bytes.
    /// Frames above this close the connection.
    pub max_message_size: usize,

    /// Outbound frames buffered per connection before sends are refused
    pub outbound_buffer: usize,

    /// Deadline for writing a single frame
    pub write_timeout_secs: u64,

    /// Connection is closed when nothing is read for this long
    pub idle_timeout_secs: u64,

    /// Ping period, kept below the idle timeout
    pub ping_interval_secs: u64,

    /// Concurrent sockets allowed per user
    pub max_connections_per_user: usize,
}

/// LLM collaborator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    /// Model used until a session selects one
    pub default_model: String,

    /// Upper bound for one model turn, streaming included
    pub timeout_secs: u64,
}

/// Storage collaborator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Deadline applied to every storage call
    pub timeout_secs: u64,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CorsSettings {
    /// Allowed origins, shared with the WebSocket origin check.
    /// Empty allows every origin and is logged as a warning.
    pub allowed_origins: Vec<String>,
}

/// Minimum required length for JWT secret (256 bits = 32 bytes)
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

/// Substrings that mark a placeholder secret.
const WEAK_SECRET_MARKERS: &[&str] = &[
    "secret",
    "test",
    "password",
    "admin",
    "changeme",
    "default",
    "example",
    "demo",
    "12345",
    "placeholder",
];

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. Built-in defaults
    /// 2. config/default.toml (base configuration)
    /// 3. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 4. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed,
    /// or if the JWT secret is unusable.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        Config::builder()
            .set_default("environment", environment.clone())?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.path_prefix", "")?
            .set_default("server.shutdown_timeout_secs", 30)?
            .set_default("rate_limit.message_limit", 100)?
            .set_default("rate_limit.message_window_secs", 60)?
            .set_default("rate_limit.admin_limit", 20)?
            .set_default("rate_limit.admin_window_secs", 60)?
            .set_default("rate_limit.public_limit", 60)?
            .set_default("rate_limit.public_window_secs", 60)?
            .set_default("rate_limit.cleanup_interval_secs", 300)?
            .set_default("rate_limit.trust_proxy_headers", false)?
            .set_default("session.reconnect_grace_secs", 900)?
            .set_default("session.ttl_secs", 900)?
            .set_default("session.cleanup_interval_secs", 300)?
            .set_default("websocket.max_message_size", 1_048_576_i64)? // 1MB
            .set_default("websocket.outbound_buffer", 256)?
            .set_default("websocket.write_timeout_secs", 10)?
            .set_default("websocket.idle_timeout_secs", 60)?
            .set_default("websocket.ping_interval_secs", 54)?
            .set_default("websocket.max_connections_per_user", 10)?
            .set_default("llm.default_model", "gpt-4")?
            .set_default("llm.timeout_secs", 60)?
            .set_default("storage.timeout_secs", 5)?
            .set_default("cors.allowed_origins", Vec::<String>::new())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // APP__SERVER__PORT=8080 -> server.port = 8080
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cors.allowed_origins")
                    .try_parsing(true),
            )
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("jwt.secret", std::env::var("JWT_SECRET").ok())?
            .build()?
            .try_deserialize()
            .and_then(|settings: Self| {
                settings.validate()?;
                Ok(settings)
            })
    }

    /// Reject configurations the server must not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_jwt_secret(&self.jwt.secret)?;

        let prefix = self.server.path_prefix.trim_end_matches('/');
        if !prefix.is_empty() && !prefix.starts_with('/') {
            return Err(ConfigError::Message(format!(
                "server.path_prefix must start with '/': {}",
                self.server.path_prefix
            )));
        }
        if self.websocket.max_message_size == 0 {
            return Err(ConfigError::Message(
                "websocket.max_message_size must be greater than zero".into(),
            ));
        }
        if self.websocket.outbound_buffer == 0 {
            return Err(ConfigError::Message(
                "websocket.outbound_buffer must be greater than zero".into(),
            ));
        }
        for (name, limit) in [
            ("message", self.rate_limit.message_limit),
            ("admin", self.rate_limit.admin_limit),
            ("public", self.rate_limit.public_limit),
        ] {
            if limit == 0 {
                return Err(ConfigError::Message(format!(
                    "rate_limit.{}_limit must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Get the full server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            jwt: JwtSettings {
                secret: String::new(),
            },
            rate_limit: RateLimitSettings::default(),
            session: SessionSettings::default(),
            websocket: WebSocketSettings::default(),
            llm: LlmSettings::default(),
            storage: StorageSettings::default(),
            cors: CorsSettings::default(),
            environment: "development".into(),
        }
    }
}

/// Validate a JWT secret for length and obvious placeholder values.
pub fn validate_jwt_secret(secret: &str) -> Result<(), ConfigError> {
    if secret.len() < MIN_JWT_SECRET_LENGTH {
        return Err(ConfigError::Message(format!(
            "JWT secret must be at least {} characters for security. Current length: {}",
            MIN_JWT_SECRET_LENGTH,
            secret.len()
        )));
    }

    let lowered = secret.to_lowercase();
    if let Some(marker) = WEAK_SECRET_MARKERS.iter().find(|m| lowered.contains(*m)) {
        return Err(ConfigError::Message(format!(
            "JWT secret contains weak pattern '{}'; use a randomly generated value",
            marker
        )));
    }
    Ok(())
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            path_prefix: String::new(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            message_limit: 100,
            message_window_secs: 60,
            admin_limit: 20,
            admin_window_secs: 60,
            public_limit: 60,
            public_window_secs: 60,
            cleanup_interval_secs: 300,
            trust_proxy_headers: false,
        }
    }
}

impl RateLimitSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_grace_secs: 900,
            ttl_secs: 900,
            cleanup_interval_secs: 300,
        }
    }
}

impl SessionSettings {
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            max_message_size: 1_048_576,
            outbound_buffer: 256,
            write_timeout_secs: 10,
            idle_timeout_secs: 60,
            ping_interval_secs: 54,
            max_connections_per_user: 10,
        }
    }
}

impl WebSocketSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_model: "gpt-4".into(),
            timeout_secs: 60,
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

impl StorageSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
