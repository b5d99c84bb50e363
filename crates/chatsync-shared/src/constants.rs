/// Typing records older than this are ignored locally.
pub const TYPING_TTL_MS: i64 = 10_000;

/// A send with no acknowledgement after this long is treated as failed.
pub const ACK_TIMEOUT_MS: u64 = 15_000;

/// Delivered outbox ids remembered for duplicate detection.
pub const CONFIRMED_RETENTION: usize = 1_000;

/// Default number of messages per window / page.
pub const DEFAULT_PAGE_SIZE: usize = 30;

/// First retry delay for transient network errors.
pub const BACKOFF_BASE_MS: u64 = 250;

/// Upper bound for the retry delay.
pub const BACKOFF_MAX_MS: u64 = 30_000;

/// Compare-and-set attempts before a transaction gives up.
pub const TRANSACT_MAX_RETRIES: u32 = 25;

/// Conversation records older than this are refetched on access.
pub const DIRECTORY_TTL_MS: u64 = 60_000;

/// Maximum length of the conversation preview text.
pub const PREVIEW_MAX_CHARS: usize = 80;

/// Key the store resolves to its own clock on write.
pub const SERVER_VALUE_KEY: &str = ".sv";
