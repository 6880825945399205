use std::time::Duration;

/// Runtime configuration loaded from environment variables, following the
/// same `std::env::var(...).expect/.unwrap_or_else` convention the rest of
/// this codebase's binaries use rather than a config-file framework.
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub bind_addr: String,
    pub log_level: String,
    pub jwt_secret: String,
    pub max_connections: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            jwt_secret: std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
        }
    }
}

pub const REQUIRED_AUDIENCE: &str = "secureconnect-api";

pub const PRESENCE_TTL: Duration = Duration::from_secs(60);
