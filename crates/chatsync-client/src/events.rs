use serde::Serialize;
use tokio::sync::broadcast;

use chatsync_shared::{ConversationId, OutboxState, TempId, UserId};

/// Notifications pushed to the host application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    WindowChanged {
        conversation_id: ConversationId,
    },
    ConversationRemoved {
        conversation_id: ConversationId,
    },
    OutboxChanged {
        conversation_id: ConversationId,
        temp_id: TempId,
        state: OutboxState,
    },
    MessageConfirmed {
        conversation_id: ConversationId,
        temp_id: TempId,
        message_id: String,
    },
    PresenceChanged {
        user_id: UserId,
    },
    TypingChanged {
        conversation_id: ConversationId,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        count: u64,
    },
    ConnectionChanged {
        connected: bool,
    },
}

/// Fan-out of [`SyncEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        tracing::trace!(?event, "emit");
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
