//! Domain model shared by the cache, the outbox and the trackers.
//!
//! These are the decoded, validated shapes. The JSON layout written to the
//! hosted store lives in [`crate::record`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constants::PREVIEW_MAX_CHARS;
use crate::error::SyncError;
use crate::types::{ConversationId, MessageId, ServerTime, TempId, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationKind {
    /// Exactly two distinct participants.
    Direct { participants: [UserId; 2] },
    /// At least one admin at all times.
    Group {
        name: String,
        members: BTreeMap<UserId, Role>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub last_message: Option<String>,
    pub last_message_time: Option<ServerTime>,
    pub created_at: ServerTime,
}

impl Conversation {
    pub fn is_direct(&self) -> bool {
        matches!(self.kind, ConversationKind::Direct { .. })
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        match &self.kind {
            ConversationKind::Direct { participants } => participants.contains(user),
            ConversationKind::Group { members, .. } => members.contains_key(user),
        }
    }

    /// The other participant of a direct conversation.
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        match &self.kind {
            ConversationKind::Direct { participants } => {
                if &participants[0] == user {
                    Some(&participants[1])
                } else if &participants[1] == user {
                    Some(&participants[0])
                } else {
                    None
                }
            }
            ConversationKind::Group { .. } => None,
        }
    }

    pub fn members(&self) -> Vec<UserId> {
        match &self.kind {
            ConversationKind::Direct { participants } => participants.to_vec(),
            ConversationKind::Group { members, .. } => members.keys().cloned().collect(),
        }
    }

    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        match &self.kind {
            ConversationKind::Direct { participants } => {
                participants.contains(user).then_some(Role::Member)
            }
            ConversationKind::Group { members, .. } => members.get(user).copied(),
        }
    }

    /// Check the structural invariants of the conversation kind.
    pub fn validate(&self) -> Result<(), SyncError> {
        match &self.kind {
            ConversationKind::Direct { participants } => {
                if participants[0] == participants[1] {
                    return Err(SyncError::InvalidConversation(format!(
                        "direct conversation {} needs two distinct participants",
                        self.id
                    )));
                }
            }
            ConversationKind::Group { members, .. } => {
                if admin_count(members) == 0 {
                    return Err(SyncError::LastAdmin(self.id.clone()));
                }
            }
        }
        Ok(())
    }
}

pub fn admin_count(members: &BTreeMap<UserId, Role>) -> usize {
    members.values().filter(|r| **r == Role::Admin).count()
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Text {
        text: String,
    },
    File {
        name: String,
        size: u64,
        url: String,
    },
    Voice {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        url: String,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
    Announcement {
        text: String,
    },
    System {
        text: String,
    },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    /// System messages never bump unread counters.
    pub fn is_system(&self) -> bool {
        matches!(self, MessageBody::System { .. })
    }

    /// Short human-readable summary for the conversation list.
    pub fn preview(&self) -> String {
        let raw = match self {
            MessageBody::Text { text }
            | MessageBody::Announcement { text }
            | MessageBody::System { text } => text.clone(),
            MessageBody::File { name, .. } => format!("[file] {name}"),
            MessageBody::Voice { .. } => "[voice message]".to_string(),
            MessageBody::Poll { question, .. } => format!("[poll] {question}"),
        };
        raw.chars().take(PREVIEW_MAX_CHARS).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    /// Unicode emoji or a custom reaction id.
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub deleted_at: ServerTime,
    pub deleted_by: UserId,
}

/// A live message keeps its body; a soft-deleted one only its tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Active {
        body: MessageBody,
        edited: bool,
        reactions: BTreeSet<Reaction>,
    },
    Deleted(Tombstone),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub created_at_client: ServerTime,
    /// `None` until the store confirms the message.
    pub created_at_server: Option<ServerTime>,
    pub reply_to: Option<String>,
    pub read_by: BTreeMap<UserId, ServerTime>,
    pub content: MessageContent,
}

impl Message {
    /// A fresh, unconfirmed message built from a draft.
    pub fn local(
        temp_id: TempId,
        conversation_id: ConversationId,
        sender_id: UserId,
        created_at_client: ServerTime,
        draft: &Draft,
    ) -> Self {
        Self {
            id: MessageId::Temp(temp_id),
            conversation_id,
            sender_id,
            created_at_client,
            created_at_server: None,
            reply_to: draft.reply_to.clone(),
            read_by: BTreeMap::new(),
            content: MessageContent::Active {
                body: draft.body.clone(),
                edited: false,
                reactions: BTreeSet::new(),
            },
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.id.is_confirmed() && self.created_at_server.is_some()
    }

    /// Server time when confirmed, client time otherwise.
    pub fn order_time(&self) -> ServerTime {
        self.created_at_server.unwrap_or(self.created_at_client)
    }

    pub fn body(&self) -> Option<&MessageBody> {
        match &self.content {
            MessageContent::Active { body, .. } => Some(body),
            MessageContent::Deleted(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.content, MessageContent::Deleted(_))
    }

    /// Whether `other` is the same submission under a different id.
    pub fn same_submission(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id
            && self.created_at_client == other.created_at_client
            && self.body() == other.body()
    }
}

/// What the caller hands to the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub body: MessageBody,
    pub reply_to: Option<String>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: MessageBody::text(text),
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Presence / typing / blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen: Option<ServerTime>,
}

impl PresenceRecord {
    pub fn unknown(user_id: UserId) -> Self {
        Self {
            user_id,
            online: false,
            last_seen: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingRecord {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub at: ServerTime,
}

impl TypingRecord {
    pub fn is_stale(&self, now: ServerTime, ttl_ms: i64) -> bool {
        now.millis() - self.at.millis() > ttl_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockRelation {
    pub blocker: UserId,
    pub blocked: UserId,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Sending,
    Confirmed,
    Failed,
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxState::Pending => "pending",
            OutboxState::Sending => "sending",
            OutboxState::Confirmed => "confirmed",
            OutboxState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxState::Pending),
            "sending" => Some(OutboxState::Sending),
            "confirmed" => Some(OutboxState::Confirmed),
            "failed" => Some(OutboxState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub temp_id: TempId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub draft: Draft,
    pub created_at_client: ServerTime,
    /// Store key reserved on the first attempt and reused by every retry.
    pub reserved_id: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub state: OutboxState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(members: &[(&str, Role)]) -> Conversation {
        Conversation {
            id: "g1".into(),
            kind: ConversationKind::Group {
                name: "team".into(),
                members: members
                    .iter()
                    .map(|(u, r)| (UserId::from(*u), *r))
                    .collect(),
            },
            last_message: None,
            last_message_time: None,
            created_at: ServerTime(1),
        }
    }

    #[test]
    fn direct_counterpart() {
        let conv = Conversation {
            id: "d1".into(),
            kind: ConversationKind::Direct {
                participants: ["alice".into(), "bob".into()],
            },
            last_message: None,
            last_message_time: None,
            created_at: ServerTime(1),
        };
        assert_eq!(conv.counterpart(&"alice".into()), Some(&"bob".into()));
        assert_eq!(conv.counterpart(&"carol".into()), None);
        assert!(conv.validate().is_ok());
    }

    #[test]
    fn group_without_admin_is_invalid() {
        let conv = group(&[("a", Role::Member), ("b", Role::Member)]);
        assert_eq!(conv.validate(), Err(SyncError::LastAdmin("g1".into())));
        assert!(group(&[("a", Role::Admin)]).validate().is_ok());
    }

    #[test]
    fn preview_is_truncated() {
        let body = MessageBody::text("x".repeat(500));
        assert_eq!(body.preview().chars().count(), PREVIEW_MAX_CHARS);
        let poll = MessageBody::Poll {
            question: "lunch?".into(),
            options: vec!["yes".into()],
        };
        assert_eq!(poll.preview(), "[poll] lunch?");
    }

    #[test]
    fn same_submission_ignores_ids() {
        let draft = Draft::text("hi");
        let a = Message::local(TempId::new(), "c".into(), "u".into(), ServerTime(10), &draft);
        let mut b = a.clone();
        b.id = MessageId::Confirmed("k1".into());
        b.created_at_server = Some(ServerTime(12));
        assert!(a.same_submission(&b));
        b.created_at_client = ServerTime(11);
        assert!(!a.same_submission(&b));
    }

    #[test]
    fn typing_staleness() {
        let rec = TypingRecord {
            conversation_id: "c".into(),
            user_id: "u".into(),
            at: ServerTime(1_000),
        };
        assert!(!rec.is_stale(ServerTime(11_000), 10_000));
        assert!(rec.is_stale(ServerTime(11_001), 10_000));
    }
}
