//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HOOKGATE_LISTEN`, `HOOKGATE_DATA_DIR`,
//!    `HOOKGATE_FIXTURES`
//! 2. **Config file**: path via `--config <path>`, or `hookgate.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! data_dir = "/var/lib/hookgate"
//! fixtures = "/etc/hookgate/fixtures.toml"   # seed for the in-memory store
//!
//! [session]
//! auth_timeout_secs = 30
//! ping_interval_secs = 30
//! read_timeout_secs = 60
//! write_timeout_secs = 10
//! max_message_size = 8192
//! send_buffer = 256
//!
//! [delivery]
//! workers = 10
//! max_attempts = 3
//! attempt_timeout_secs = 30
//! backoff_base_secs = 10
//! backoff_max_secs = 600
//! journal_compact_threshold = 1000
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::{QueueSettings, RetryPolicy};
use crate::session::SessionSettings;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and storage locations.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persistent data (delivery journal). Default `/var/lib/hookgate`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// TOML file seeding accounts, devices and rules. Override with `HOOKGATE_FIXTURES`.
    #[serde(default)]
    pub fixtures: Option<String>,
}

/// Device session timing and limits.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds a new connection has to send `AUTH` (default 30).
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    /// Seconds between server heartbeat pings (default 30).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds without inbound traffic before a session is dropped (default 60).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Seconds a single socket write may take (default 10).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Largest accepted inbound frame in bytes (default 8192).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Outbound buffer capacity per session in messages (default 256).
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

/// Webhook delivery queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Concurrent webhook workers (default 10).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per job including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt HTTP timeout in seconds (default 30).
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// First retry delay in seconds, doubled per attempt (default 10).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Retry delay cap in seconds (default 600).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    /// Finished jobs between journal compactions (default 1000).
    #[serde(default = "default_compact_threshold")]
    pub journal_compact_threshold: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/hookgate".to_string()
}
fn default_auth_timeout() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    30
}
fn default_read_timeout() -> u64 {
    60
}
fn default_write_timeout() -> u64 {
    10
}
fn default_max_message_size() -> usize {
    crate::protocol::MAX_MESSAGE_SIZE
}
fn default_send_buffer() -> usize {
    256
}
fn default_workers() -> usize {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_attempt_timeout() -> u64 {
    30
}
fn default_backoff_base() -> u64 {
    10
}
fn default_backoff_max() -> u64 {
    600
}
fn default_compact_threshold() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            fixtures: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout(),
            ping_interval_secs: default_ping_interval(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_message_size: default_max_message_size(),
            send_buffer: default_send_buffer(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            journal_compact_threshold: default_compact_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `hookgate.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("hookgate.toml").exists() {
            let content =
                std::fs::read_to_string("hookgate.toml").expect("Failed to read hookgate.toml");
            toml::from_str(&content).expect("Failed to parse hookgate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("HOOKGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("HOOKGATE_DATA_DIR") {
            config.server.data_dir = dir;
        }
        if let Ok(fixtures) = std::env::var("HOOKGATE_FIXTURES") {
            config.server.fixtures = Some(fixtures);
        }

        config
    }

    pub fn session_settings(&self) -> SessionSettings {
        let s = &self.session;
        SessionSettings {
            auth_timeout: Duration::from_secs(s.auth_timeout_secs),
            ping_interval: Duration::from_secs(s.ping_interval_secs.max(1)),
            read_timeout: Duration::from_secs(s.read_timeout_secs.max(1)),
            write_timeout: Duration::from_secs(s.write_timeout_secs.max(1)),
            max_message_size: s.max_message_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let d = &self.delivery;
        RetryPolicy {
            max_attempts: d.max_attempts.max(1),
            attempt_timeout: Duration::from_secs(d.attempt_timeout_secs),
            backoff_base: Duration::from_secs(d.backoff_base_secs),
            backoff_max: Duration::from_secs(d.backoff_max_secs),
        }
    }

    /// Queue settings with the journal under `<data_dir>/delivery`.
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            dir: PathBuf::from(&self.server.data_dir).join("delivery"),
            workers: self.delivery.workers,
            retry: self.retry_policy(),
            compact_threshold: self.delivery.journal_compact_threshold,
        }
    }
}
