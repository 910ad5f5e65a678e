//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use veilbox_shared::constants::DEFAULT_HTTP_PORT;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Directory holding the relay snapshot files and the salt.
    /// Env: `DATA_DIR`
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Seconds between periodic snapshot flushes (0 = only at shutdown).
    /// Env: `SAVE_INTERVAL_SECS`
    /// Default: `300`
    pub save_interval_secs: u64,

    /// Seconds between sweeps of idle per-user locks (0 = never).
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `600`
    pub sweep_interval_secs: u64,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Shared secret the update bridge must send in `X-Webhook-Secret`.
    /// Env: `WEBHOOK_SECRET`
    /// Default: empty (updates accepted without a secret).
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("data_dir", &self.data_dir)
            .field("save_interval_secs", &self.save_interval_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<set>"))
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            data_dir: PathBuf::from("./data"),
            save_interval_secs: 300,
            sweep_interval_secs: 600,
            admin_token: None,
            webhook_secret: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Some(dir) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(val) = lookup("SAVE_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.save_interval_secs = secs,
                Err(_) => tracing::warn!(value = %val, "Invalid SAVE_INTERVAL_SECS, using default"),
            }
        }

        if let Some(val) = lookup("SWEEP_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.sweep_interval_secs = secs,
                Err(_) => tracing::warn!(value = %val, "Invalid SWEEP_INTERVAL_SECS, using default"),
            }
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(secret) = lookup("WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook_secret = Some(secret);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
