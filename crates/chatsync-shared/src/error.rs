use thiserror::Error;

use crate::types::{ConversationId, UserId};

/// Errors surfaced by the sync engine and the remote store adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The store could not be reached; safe to retry with backoff.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("{sender} is blocked in conversation {conversation}")]
    Blocked {
        sender: UserId,
        conversation: ConversationId,
    },

    #[error("{user} is not a member of conversation {conversation}")]
    NotAMember {
        user: UserId,
        conversation: ConversationId,
    },

    #[error("Conversation removed: {0}")]
    ConversationRemoved(ConversationId),

    /// A compare-and-set lost against a concurrent writer.
    #[error("Conflicting write at {0}")]
    ConflictingWrite(String),

    /// A transaction kept conflicting and gave up.
    #[error("Write failed at {path} after {attempts} attempts")]
    WriteFailed { path: String, attempts: u32 },

    #[error("No acknowledgement after {0} ms")]
    AckTimeout(u64),

    #[error("Reply target {0} does not exist in this conversation")]
    InvalidReply(String),

    #[error("Conversation {0} must keep at least one admin")]
    LastAdmin(ConversationId),

    #[error("Invalid conversation record: {0}")]
    InvalidConversation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Local store error: {0}")]
    LocalStore(String),
}

impl SyncError {
    /// Whether the operation may succeed if attempted again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_)
                | SyncError::ConflictingWrite(_)
                | SyncError::AckTimeout(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

/// Convenience alias used throughout the workspace.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(SyncError::TransientNetwork("offline".into()).is_retryable());
        assert!(SyncError::AckTimeout(15_000).is_retryable());
        assert!(!SyncError::Blocked {
            sender: "b".into(),
            conversation: "c".into(),
        }
        .is_retryable());
        assert!(!SyncError::ConversationRemoved("c".into()).is_retryable());
        assert!(!SyncError::WriteFailed {
            path: "x".into(),
            attempts: 3
        }
        .is_retryable());
    }
}
