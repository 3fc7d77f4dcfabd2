//! Server configuration loaded from environment variables.

/// Server configuration.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Log lines returned by the status endpoint (default: `50`).
    pub log_tail: usize,
    /// Maximum runs returned by the history listing (default: `50`).
    pub history_limit: u32,
    /// Reject a second submission while the owner has an active job
    /// (default: `true`).
    pub single_active: bool,
    /// Optimistic capacity pre-check: reject submissions once a tier's
    /// queued backlog reaches this depth. Unset disables the check.
    pub max_queue_depth: Option<u32>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                 |
    /// |--------------------------|-------------------------|
    /// | `HOST`                   | `0.0.0.0`               |
    /// | `PORT`                   | `3000`                  |
    /// | `CORS_ORIGINS`           | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`   | `30`                    |
    /// | `TABSYN_LOG_TAIL`        | `50`                    |
    /// | `TABSYN_HISTORY_LIMIT`   | `50`                    |
    /// | `TABSYN_SINGLE_ACTIVE`   | `true`                  |
    /// | `TABSYN_MAX_QUEUE_DEPTH` | unset                   |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let log_tail: usize = std::env::var("TABSYN_LOG_TAIL")
            .unwrap_or_else(|_| "50".into())
            .parse()
            .expect("TABSYN_LOG_TAIL must be a valid usize");

        let history_limit: u32 = std::env::var("TABSYN_HISTORY_LIMIT")
            .unwrap_or_else(|_| "50".into())
            .parse()
            .expect("TABSYN_HISTORY_LIMIT must be a valid u32");

        let single_active: bool = std::env::var("TABSYN_SINGLE_ACTIVE")
            .unwrap_or_else(|_| "true".into())
            .parse()
            .expect("TABSYN_SINGLE_ACTIVE must be true or false");

        let max_queue_depth: Option<u32> = std::env::var("TABSYN_MAX_QUEUE_DEPTH")
            .ok()
            .map(|v| v.parse().expect("TABSYN_MAX_QUEUE_DEPTH must be a valid u32"));

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            log_tail,
            history_limit,
            single_active,
            max_queue_depth,
        }
    }
}
