//! Environment configuration.
//!
//! `dotenvy::dotenv().ok()` followed by plain
//! `std::env::var(..).unwrap_or_else(..)` reads, rather than a derive-based
//! config crate.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub poll_interval: Duration,
    pub timer_poller_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/chatgame".to_string());
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let poll_interval_ms: u64 = std::env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);
        let timer_poller_enabled = std::env::var("TIMER_POLLER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            database_url,
            redis_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            timer_poller_enabled,
        }
    }
}
