use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub google: GoogleConfig,
    pub http: HttpConfig,
    pub sync: SyncConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin for the dashboard that triggers syncs.
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

/// OAuth client credentials and endpoints for Google Calendar.
///
/// Injected into the token manager and the calendar client at construction so
/// that nothing reads credentials from the environment at request time.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: String,
    pub calendar_api_url: String,
    /// `maxResults` for the events-list call.
    pub events_page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Per-call timeout for every outbound request.
    pub timeout_seconds: u64,
    /// Retries after the first attempt for transient failures (network, 429, 5xx).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failures before the circuit opens.
    pub circuit_failure_threshold: u32,
    /// How long an open circuit rejects calls before letting a probe through.
    pub circuit_cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub default_window_days: u32,
    /// Historical window length; also the upper clamp for any requested window.
    pub historical_window_days: u32,
    pub worker_enabled: bool,
    pub worker_interval_seconds: u64,
    pub rematch_max_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the sync and rematch endpoints
    pub sync_per_second: u32,
    /// Burst size for the sync and rematch endpoints
    pub sync_burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL").unwrap_or(defaults.server.frontend_url),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            google: GoogleConfig {
                client_id: env::var("GOOGLE_CLIENT_ID").ok().filter(|v| !v.is_empty()),
                client_secret: env::var("GOOGLE_CLIENT_SECRET")
                    .ok()
                    .filter(|v| !v.is_empty()),
                token_url: env::var("GOOGLE_TOKEN_URL").unwrap_or(defaults.google.token_url),
                calendar_api_url: env::var("GOOGLE_CALENDAR_API_URL")
                    .unwrap_or(defaults.google.calendar_api_url),
                events_page_size: parse_or("GOOGLE_EVENTS_PAGE_SIZE", 2500),
            },
            http: HttpConfig {
                timeout_seconds: parse_or("HTTP_TIMEOUT_SECONDS", 30),
                max_retries: parse_or("HTTP_MAX_RETRIES", 3),
                initial_backoff_ms: parse_or("HTTP_INITIAL_BACKOFF_MS", 500),
                max_backoff_ms: parse_or("HTTP_MAX_BACKOFF_MS", 10_000),
                circuit_failure_threshold: parse_or("CIRCUIT_FAILURE_THRESHOLD", 5),
                circuit_cooldown_seconds: parse_or("CIRCUIT_COOLDOWN_SECONDS", 60),
            },
            sync: SyncConfig {
                default_window_days: parse_or("SYNC_DEFAULT_WINDOW_DAYS", 90),
                historical_window_days: parse_or("SYNC_HISTORICAL_WINDOW_DAYS", 365),
                worker_enabled: match env::var("SYNC_WORKER_ENABLED") {
                    Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
                    Err(_) => false,
                },
                worker_interval_seconds: parse_or("SYNC_WORKER_INTERVAL_SECONDS", 3600),
                rematch_max_batch_size: parse_or("REMATCH_MAX_BATCH_SIZE", 500),
            },
            rate_limit: RateLimitConfig {
                sync_per_second: parse_or("RATE_LIMIT_SYNC_PER_SECOND", 2),
                sync_burst: parse_or("RATE_LIMIT_SYNC_BURST", 10),
            },
        })
    }
}

/// Read an optional numeric tunable, keeping the default when unset or unparseable.
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/calendar.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            google: GoogleConfig {
                client_id: None,
                client_secret: None,
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                calendar_api_url: "https://www.googleapis.com/calendar/v3".to_string(),
                events_page_size: 2500,
            },
            http: HttpConfig {
                timeout_seconds: 30,
                max_retries: 3,
                initial_backoff_ms: 500,
                max_backoff_ms: 10_000,
                circuit_failure_threshold: 5,
                circuit_cooldown_seconds: 60,
            },
            sync: SyncConfig {
                default_window_days: 90,
                historical_window_days: 365,
                worker_enabled: false,
                worker_interval_seconds: 3600,
                rematch_max_batch_size: 500,
            },
            rate_limit: RateLimitConfig {
                sync_per_second: 2,
                sync_burst: 10,
            },
        }
    }
}
