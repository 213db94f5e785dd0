// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the update agent.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Parse a millisecond env var into a Duration with a default.
fn env_ms(var: &str, default: u64) -> Duration {
    Duration::from_millis(
        env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

/// Agent configuration loaded from environment variables.
///
/// Immutable for the process lifetime. See the crate root for the full
/// variable table.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Device identifier, used in the default origin URL and in logs.
    pub device_id: String,
    /// Origin endpoint serving the signed worker script.
    pub origin_url: String,
    /// Shared secret for script signature verification.
    pub shared_secret: String,
    /// Delay between update polls.
    pub poll_interval: Duration,
    /// Directory the live script is installed into.
    pub script_dir: PathBuf,
    /// File name of the live script inside `script_dir`.
    pub script_file: String,
    /// Path of the persisted install metadata record.
    pub metadata_path: PathBuf,
    /// Interpreter the worker script is launched with.
    pub interpreter: PathBuf,
    /// Timeout for a single origin request.
    pub fetch_timeout: Duration,
    /// How long a freshly started worker must stay alive to pass its health check.
    pub health_wait: Duration,
    /// Base delay for crash-restart and fetch-retry backoff.
    pub restart_backoff: Duration,
    /// Ceiling for crash-restart and fetch-retry backoff.
    pub max_restart_backoff: Duration,
    /// How long a retiring worker gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Fetch attempts per update cycle before deferring to the next poll.
    pub max_fetch_retries: u32,
    /// Number of rotated script backups to retain.
    pub backup_keep: usize,
}

impl AgentConfig {
    /// Create a configuration with defaults for the given device and secret.
    pub fn new(device_id: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            origin_url: format!("http://localhost:3000/remote/{device_id}/script"),
            device_id,
            shared_secret: shared_secret.into(),
            poll_interval: Duration::from_secs(60),
            script_dir: PathBuf::from("scripts"),
            script_file: "script.js".to_string(),
            metadata_path: PathBuf::from("state/meta.json"),
            interpreter: PathBuf::from("node"),
            fetch_timeout: Duration::from_secs(15),
            health_wait: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(1),
            max_restart_backoff: Duration::from_secs(300),
            stop_grace: Duration::from_secs(5),
            max_fetch_retries: 5,
            backup_keep: 3,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `HELIOS_SHARED_SECRET` is required; the agent refuses to start without
    /// it rather than fall back to a well-known secret. Everything else has a
    /// default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let device_id = env::var("HELIOS_DEVICE_ID").unwrap_or_else(|_| "1".to_string());
        let shared_secret = env::var("HELIOS_SHARED_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("HELIOS_SHARED_SECRET"))?;

        let mut config = Self::new(device_id, shared_secret);
        if let Ok(url) = env::var("HELIOS_ORIGIN_URL") {
            config.origin_url = url;
        }
        if let Ok(dir) = env::var("HELIOS_SCRIPT_DIR") {
            config.script_dir = PathBuf::from(dir);
        }
        if let Ok(file) = env::var("HELIOS_SCRIPT_FILE") {
            config.script_file = file;
        }
        if let Ok(path) = env::var("HELIOS_META_FILE") {
            config.metadata_path = PathBuf::from(path);
        }
        if let Ok(interpreter) = env::var("HELIOS_INTERPRETER") {
            config.interpreter = PathBuf::from(interpreter);
        }
        config.poll_interval = env_ms("HELIOS_POLL_INTERVAL_MS", 60_000);
        config.fetch_timeout = env_ms("HELIOS_FETCH_TIMEOUT_MS", 15_000);
        config.health_wait = env_ms("HELIOS_HEALTH_WAIT_MS", 5_000);
        config.restart_backoff = env_ms("HELIOS_RESTART_BACKOFF_MS", 1_000);
        config.max_restart_backoff = env_ms("HELIOS_MAX_RESTART_BACKOFF_MS", 300_000);
        config.stop_grace = env_ms("HELIOS_STOP_GRACE_MS", 5_000);
        config.max_fetch_retries = env::var("HELIOS_MAX_FETCH_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        config.backup_keep = env::var("HELIOS_BACKUP_KEEP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        Ok(config)
    }

    /// Full path of the live worker script.
    pub fn script_path(&self) -> PathBuf {
        self.script_dir.join(&self.script_file)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
}
