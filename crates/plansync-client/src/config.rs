//! Client sync configuration loaded from environment variables.
//!
//! Every setting has a default so a session can start with zero
//! configuration.

use std::time::Duration;

use plansync_shared::constants::{
    CHUNK_SIZE, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, PBKDF2_ITERATIONS, SETTLE_WINDOW_MS,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Envelopes longer than this many bytes are sent as chunks.
    /// Env: `PLANSYNC_CHUNK_SIZE`
    /// Default: 16 KiB
    pub chunk_size: usize,

    /// How often open channels are pinged.
    /// Env: `PLANSYNC_HEARTBEAT_INTERVAL_MS`
    /// Default: 5 s
    pub heartbeat_interval: Duration,

    /// A peer silent for this long is dropped.
    /// Env: `PLANSYNC_HEARTBEAT_TIMEOUT_MS`
    /// Default: 15 s
    pub heartbeat_timeout: Duration,

    /// Local changes right after a remote apply are not rebroadcast.
    /// Env: `PLANSYNC_SETTLE_WINDOW_MS`
    /// Default: 100 ms
    pub settle_window: Duration,

    /// PBKDF2 rounds for room credentials. Every replica of a room must use
    /// the same value.
    /// Env: `PLANSYNC_KDF_ITERATIONS`
    /// Default: 100 000
    pub kdf_iterations: u32,

    /// Base URL of the relay backend, when one is used.
    /// Env: `PLANSYNC_RELAY_URL`
    /// Default: none
    pub relay_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            settle_window: Duration::from_millis(SETTLE_WINDOW_MS),
            kdf_iterations: PBKDF2_ITERATIONS,
            relay_url: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_positive(&lookup, "PLANSYNC_CHUNK_SIZE") {
            config.chunk_size = n as usize;
        }

        if let Some(ms) = parse_positive(&lookup, "PLANSYNC_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_positive(&lookup, "PLANSYNC_HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("PLANSYNC_SETTLE_WINDOW_MS") {
            match val.trim().parse::<u64>() {
                Ok(ms) => config.settle_window = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid PLANSYNC_SETTLE_WINDOW_MS, using default")
                }
            }
        }

        if let Some(n) = parse_positive(&lookup, "PLANSYNC_KDF_ITERATIONS") {
            match u32::try_from(n) {
                Ok(n) => config.kdf_iterations = n,
                Err(_) => tracing::warn!(value = n, "PLANSYNC_KDF_ITERATIONS out of range, using default"),
            }
        }

        if let Some(url) = lookup("PLANSYNC_RELAY_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.is_empty() {
                config.relay_url = Some(url);
            }
        }

        if config.heartbeat_timeout <= config.heartbeat_interval {
            tracing::warn!(
                interval_ms = config.heartbeat_interval.as_millis() as u64,
                timeout_ms = config.heartbeat_timeout.as_millis() as u64,
                "Heartbeat timeout does not exceed the interval; peers will flap"
            );
        }

        config
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let val = lookup(key)?;
    match val.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %val, "Invalid value, using default");
            None
        }
    }
}
