//! Server Configuration

use crate::state::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TTL_SECS};

/// Process-level settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Public URL the gateway redirects customers back to
    pub base_url: String,
    pub seed_demo_data: bool,
    /// Idle seconds before an unfinished checkout is forgotten
    pub session_ttl_secs: i64,
    pub max_wizard_sessions: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            seed_demo_data: std::env::var("SEED_DEMO_DATA").is_ok_and(|v| {
                matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
            }),
            session_ttl_secs: parse_env("SESSION_TTL_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_SESSION_TTL_SECS),
            max_wizard_sessions: parse_env("MAX_WIZARD_SESSIONS")
                .filter(|max| *max > 0)
                .unwrap_or(DEFAULT_MAX_SESSIONS),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
