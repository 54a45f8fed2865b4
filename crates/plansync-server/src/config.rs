//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development.

use std::net::SocketAddr;

use plansync_shared::constants::DEFAULT_HTTP_PORT;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `PLANSYNC_HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Largest accepted request body in bytes.
    /// Env: `PLANSYNC_MAX_BODY_BYTES`
    /// Default: 10 MiB
    pub max_body_bytes: usize,

    /// Records a single room may hold (0 = unlimited).
    /// Env: `PLANSYNC_MAX_RECORDS`
    /// Default: `10000`
    pub max_records_per_room: usize,

    /// Sustained requests per second per client IP.
    /// Env: `PLANSYNC_RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Burst allowance per client IP.
    /// Env: `PLANSYNC_RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            max_body_bytes: 10 * 1024 * 1024,
            max_records_per_room: 10_000,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("PLANSYNC_HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid PLANSYNC_HTTP_ADDR, using default"),
            }
        }

        if let Some(val) = lookup("PLANSYNC_MAX_BODY_BYTES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_body_bytes = n,
                _ => tracing::warn!(value = %val, "Invalid PLANSYNC_MAX_BODY_BYTES, using default"),
            }
        }

        if let Some(val) = lookup("PLANSYNC_MAX_RECORDS") {
            match val.parse::<usize>() {
                Ok(n) => config.max_records_per_room = n,
                Err(_) => tracing::warn!(value = %val, "Invalid PLANSYNC_MAX_RECORDS, using default"),
            }
        }

        if let Some(val) = lookup("PLANSYNC_RATE_LIMIT_PER_SEC") {
            match val.parse::<f64>() {
                Ok(n) if n > 0.0 => config.rate_limit_per_sec = n,
                _ => tracing::warn!(value = %val, "Invalid PLANSYNC_RATE_LIMIT_PER_SEC, using default"),
            }
        }

        if let Some(val) = lookup("PLANSYNC_RATE_LIMIT_BURST") {
            match val.parse::<f64>() {
                Ok(n) if n >= 1.0 => config.rate_limit_burst = n,
                _ => tracing::warn!(value = %val, "Invalid PLANSYNC_RATE_LIMIT_BURST, using default"),
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}
