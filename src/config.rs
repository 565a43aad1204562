//! Runtime configuration with environment overrides.

use std::path::PathBuf;

use crate::{runtime::handle::RuntimeConfig, upload::UploadMode};

/// Everything the composition root needs to build a [`crate::system::System`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the backend serving `/api/auth/token` and `/api/data`.
    pub backend_url: String,
    /// Sync service endpoint handed out with credentials.
    pub sync_url: String,
    /// Local database file; `:memory:` keeps everything in memory.
    pub db_path: PathBuf,
    /// Batch selection for uploads.
    pub upload_mode: UploadMode,
    /// HTTP request timeout.
    pub request_timeout_ms: u64,
    /// Periodic flush interval of the sync runtime.
    pub flush_interval_ms: u64,
    /// First retry delay after a retryable failure.
    pub initial_backoff_ms: u64,
    /// Upper bound for the retry delay.
    pub max_backoff_ms: u64,
    /// Consecutive rejections of one batch before it is reported as stalled; 0 disables.
    pub max_rejections: u32,
    /// Token lifetime assumed when the token endpoint does not send `expires_in`.
    pub token_lifetime_secs: u64,
    /// Refresh tokens this long before they expire.
    pub token_refresh_buffer_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:6060".to_string(),
            sync_url: "http://localhost:8080".to_string(),
            db_path: PathBuf::from("outbox.db"),
            upload_mode: UploadMode::default(),
            request_timeout_ms: 10_000,
            flush_interval_ms: 30_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_rejections: 5,
            token_lifetime_secs: 300,
            token_refresh_buffer_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `OUTBOX_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = read_non_empty_env("OUTBOX_BACKEND_URL") {
            config.backend_url = url;
        }
        if let Some(url) = read_non_empty_env("OUTBOX_SYNC_URL") {
            config.sync_url = url;
        }
        if let Some(path) = read_non_empty_env("OUTBOX_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(size) = read_env_u64("OUTBOX_BATCH_SIZE").filter(|v| *v > 0) {
            config.upload_mode = UploadMode::Batch(size as usize);
        }
        if read_non_empty_env("OUTBOX_UPLOAD_MODE")
            .is_some_and(|mode| mode.eq_ignore_ascii_case("transaction"))
        {
            config.upload_mode = UploadMode::Transaction;
        }
        if let Some(ms) = read_env_u64("OUTBOX_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = ms;
        }
        if let Some(ms) = read_env_u64("OUTBOX_FLUSH_INTERVAL_MS") {
            config.flush_interval_ms = ms;
        }
        if let Some(n) = read_env_u64("OUTBOX_MAX_REJECTIONS") {
            config.max_rejections = n.min(u64::from(u32::MAX)) as u32;
        }
        config
    }

    /// Sync-loop settings derived from this configuration.
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            flush_interval_ms: self.flush_interval_ms,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            ..RuntimeConfig::default()
        }
    }
}

fn read_non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}
