//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so the engine starts with zero
//! configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chatsync_shared::constants::{
    ACK_TIMEOUT_MS, BACKOFF_BASE_MS, BACKOFF_MAX_MS, DEFAULT_PAGE_SIZE, DIRECTORY_TTL_MS,
    TRANSACT_MAX_RETRIES, TYPING_TTL_MS,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Messages per window page.
    /// Env: `CHATSYNC_PAGE_SIZE`
    pub page_size: usize,

    /// A send without acknowledgement for this long, while connected,
    /// becomes failed.
    /// Env: `CHATSYNC_ACK_TIMEOUT_MS`
    pub ack_timeout: Duration,

    /// Typing records older than this are hidden.
    /// Env: `CHATSYNC_TYPING_TTL_MS`
    pub typing_ttl_ms: i64,

    /// Env: `CHATSYNC_BACKOFF_BASE_MS`
    pub backoff_base: Duration,

    /// Env: `CHATSYNC_BACKOFF_MAX_MS`
    pub backoff_max: Duration,

    /// Compare-and-set attempts before a transaction gives up.
    /// Env: `CHATSYNC_TRANSACT_RETRIES`
    pub transact_retries: u32,

    /// Transient send failures tolerated while connected before an outbox
    /// entry is marked failed.
    pub max_send_attempts: u32,

    /// Env: `CHATSYNC_DIRECTORY_TTL_MS`
    pub directory_ttl: Duration,

    /// SQLite file for the outbox and cached windows. `None` keeps them in
    /// memory for the life of the engine.
    /// Env: `CHATSYNC_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MS),
            typing_ttl_ms: TYPING_TTL_MS,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(BACKOFF_MAX_MS),
            transact_retries: TRANSACT_MAX_RETRIES,
            max_send_attempts: 5,
            directory_ttl: Duration::from_millis(DIRECTORY_TTL_MS),
            db_path: None,
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "CHATSYNC_PAGE_SIZE") {
            if n == 0 {
                tracing::warn!("CHATSYNC_PAGE_SIZE must be positive, using default");
            } else {
                config.page_size = n;
            }
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATSYNC_ACK_TIMEOUT_MS") {
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<i64>(&lookup, "CHATSYNC_TYPING_TTL_MS") {
            config.typing_ttl_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATSYNC_BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATSYNC_BACKOFF_MAX_MS") {
            config.backoff_max = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "CHATSYNC_TRANSACT_RETRIES") {
            config.transact_retries = n.max(1);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATSYNC_DIRECTORY_TTL_MS") {
            config.directory_ttl = Duration::from_millis(ms);
        }
        if let Some(path) = lookup("CHATSYNC_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        if config.backoff_max < config.backoff_base {
            tracing::warn!(
                base_ms = config.backoff_base.as_millis() as u64,
                max_ms = config.backoff_max.as_millis() as u64,
                "backoff maximum below base, raising it to the base"
            );
            config.backoff_max = config.backoff_base;
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "invalid value, using default");
            None
        }
    }
}
