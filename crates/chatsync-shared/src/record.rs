//! JSON records as they live in the hosted store, and their conversion to
//! the domain model.
//!
//! Field names are camelCase. Timestamps that the store must assign are
//! written as the `{".sv": "timestamp"}` placeholder and read back as plain
//! integer milliseconds.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::SERVER_VALUE_KEY;
use crate::error::{SyncError, SyncResult};
use crate::model::{
    Conversation, ConversationKind, Message, MessageBody, MessageContent, PresenceRecord,
    Reaction, Role, Tombstone, TypingRecord,
};
use crate::types::{ConversationId, MessageId, ServerTime, UserId};

/// Placeholder resolved to the store's clock when written.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// Placeholder that adds `n` to the current numeric value when written.
pub fn increment(n: i64) -> Value {
    json!({ SERVER_VALUE_KEY: { "increment": n } })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub sender_id: String,
    pub created_at_client: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_server: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MessageBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub read_by: BTreeMap<String, i64>,
    /// userId -> set of emoji keys
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, BTreeMap<String, bool>>,
}

impl MessageRecord {
    pub fn new(
        sender: &UserId,
        created_at_client: ServerTime,
        body: &MessageBody,
        reply_to: Option<&str>,
    ) -> Self {
        Self {
            sender_id: sender.0.clone(),
            created_at_client: created_at_client.millis(),
            created_at_server: None,
            body: Some(body.clone()),
            reply_to_id: reply_to.map(str::to_string),
            edited: false,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            read_by: BTreeMap::new(),
            reactions: BTreeMap::new(),
        }
    }

    /// Record of an already confirmed message, e.g. for local persistence.
    /// Returns `None` for unconfirmed messages.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let created_at_server = msg.created_at_server?;
        if !msg.id.is_confirmed() {
            return None;
        }
        let mut record = Self {
            sender_id: msg.sender_id.0.clone(),
            created_at_client: msg.created_at_client.millis(),
            created_at_server: Some(created_at_server.millis()),
            body: None,
            reply_to_id: msg.reply_to.clone(),
            edited: false,
            deleted: false,
            deleted_at: None,
            deleted_by: None,
            read_by: msg
                .read_by
                .iter()
                .map(|(u, t)| (u.0.clone(), t.millis()))
                .collect(),
            reactions: BTreeMap::new(),
        };
        match &msg.content {
            MessageContent::Active {
                body,
                edited,
                reactions,
            } => {
                record.body = Some(body.clone());
                record.edited = *edited;
                for r in reactions {
                    record
                        .reactions
                        .entry(r.user_id.0.clone())
                        .or_default()
                        .insert(r.emoji.clone(), true);
                }
            }
            MessageContent::Deleted(t) => {
                record.deleted = true;
                record.deleted_at = Some(t.deleted_at.millis());
                record.deleted_by = Some(t.deleted_by.0.clone());
            }
        }
        Some(record)
    }

    /// The value to write for a new message; the store stamps
    /// `createdAtServer`.
    pub fn to_write_value(&self) -> SyncResult<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("createdAtServer".to_string(), server_timestamp());
        }
        Ok(value)
    }

    pub fn into_message(self, conversation_id: ConversationId, key: &str) -> SyncResult<Message> {
        let created_at_server = self
            .created_at_server
            .ok_or_else(|| SyncError::Decode(format!("message {key} has no server timestamp")))?;

        let read_by = self
            .read_by
            .into_iter()
            .map(|(u, t)| (UserId(u), ServerTime(t)))
            .collect();

        let content = if self.deleted {
            MessageContent::Deleted(Tombstone {
                deleted_at: ServerTime(self.deleted_at.unwrap_or(created_at_server)),
                deleted_by: UserId(self.deleted_by.unwrap_or_else(|| self.sender_id.clone())),
            })
        } else {
            let body = self
                .body
                .ok_or_else(|| SyncError::Decode(format!("message {key} has no body")))?;
            let reactions: BTreeSet<Reaction> = self
                .reactions
                .into_iter()
                .flat_map(|(user, set)| {
                    set.into_iter().filter(|(_, on)| *on).map(move |(emoji, _)| Reaction {
                        user_id: UserId(user.clone()),
                        emoji,
                    })
                })
                .collect();
            MessageContent::Active {
                body,
                edited: self.edited,
                reactions,
            }
        };

        Ok(Message {
            id: MessageId::Confirmed(key.to_string()),
            conversation_id,
            sender_id: UserId(self.sender_id),
            created_at_client: ServerTime(self.created_at_client),
            created_at_server: Some(ServerTime(created_at_server)),
            reply_to: self.reply_to_id,
            read_by,
            content,
        })
    }
}

/// Decode one confirmed message stored under `messages/{c}/{key}`.
pub fn decode_message(
    conversation_id: &ConversationId,
    key: &str,
    value: &Value,
) -> SyncResult<Message> {
    let record: MessageRecord = serde_json::from_value(value.clone())?;
    record.into_message(conversation_id.clone(), key)
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, Role>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<i64>,
}

impl ConversationRecord {
    pub fn from_conversation(conv: &Conversation) -> Self {
        let (kind, participants, name, members) = match &conv.kind {
            ConversationKind::Direct { participants } => (
                "direct",
                participants.iter().map(|p| p.0.clone()).collect(),
                None,
                BTreeMap::new(),
            ),
            ConversationKind::Group { name, members } => (
                "group",
                Vec::new(),
                Some(name.clone()),
                members.iter().map(|(u, r)| (u.0.clone(), *r)).collect(),
            ),
        };
        Self {
            kind: kind.to_string(),
            participants,
            name,
            members,
            created_at: conv.created_at.millis(),
            last_message: conv.last_message.clone(),
            last_message_time: conv.last_message_time.map(|t| t.millis()),
        }
    }

    /// The value to write for a new conversation; the store stamps
    /// `createdAt`.
    pub fn to_write_value(&self) -> SyncResult<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("createdAt".to_string(), server_timestamp());
        }
        Ok(value)
    }

    pub fn into_conversation(self, id: ConversationId) -> SyncResult<Conversation> {
        let kind = match self.kind.as_str() {
            "direct" => {
                let [a, b]: [String; 2] = self.participants.try_into().map_err(|p: Vec<_>| {
                    SyncError::InvalidConversation(format!(
                        "direct conversation {id} has {} participants",
                        p.len()
                    ))
                })?;
                ConversationKind::Direct {
                    participants: [UserId(a), UserId(b)],
                }
            }
            "group" => ConversationKind::Group {
                name: self.name.unwrap_or_default(),
                members: self
                    .members
                    .into_iter()
                    .map(|(u, r)| (UserId(u), r))
                    .collect(),
            },
            other => {
                return Err(SyncError::InvalidConversation(format!(
                    "unknown conversation kind {other:?}"
                )))
            }
        };

        let conv = Conversation {
            id,
            kind,
            last_message: self.last_message,
            last_message_time: self.last_message_time.map(ServerTime),
            created_at: ServerTime(self.created_at),
        };
        conv.validate()?;
        Ok(conv)
    }
}

pub fn decode_conversation(id: &ConversationId, value: &Value) -> SyncResult<Conversation> {
    let record: ConversationRecord = serde_json::from_value(value.clone())?;
    record.into_conversation(id.clone())
}

/// Decode a `members` subtree.
pub fn decode_members(value: Option<&Value>) -> SyncResult<BTreeMap<UserId, Role>> {
    match value {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(v) => {
            let raw: BTreeMap<String, Role> = serde_json::from_value(v.clone())?;
            Ok(raw.into_iter().map(|(u, r)| (UserId(u), r)).collect())
        }
    }
}

pub fn encode_members(members: &BTreeMap<UserId, Role>) -> SyncResult<Value> {
    let raw: BTreeMap<&str, Role> = members.iter().map(|(u, r)| (u.as_str(), *r)).collect();
    Ok(serde_json::to_value(raw)?)
}

// ---------------------------------------------------------------------------
// Presence / typing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct PresenceJson {
    #[serde(default)]
    online: bool,
    #[serde(default)]
    last_seen: Option<i64>,
}

/// Value written to `presence/{uid}`; `lastSeen` is stamped by the store.
pub fn presence_value(online: bool) -> Value {
    json!({ "online": online, "lastSeen": server_timestamp() })
}

pub fn decode_presence(user_id: &UserId, value: Option<&Value>) -> PresenceRecord {
    let parsed = value
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value::<PresenceJson>(v.clone()).ok());
    match parsed {
        Some(p) => PresenceRecord {
            user_id: user_id.clone(),
            online: p.online,
            last_seen: p.last_seen.map(ServerTime),
        },
        None => PresenceRecord::unknown(user_id.clone()),
    }
}

pub fn typing_value() -> Value {
    json!({ "at": server_timestamp() })
}

/// Decode the `typing/{c}` subtree. Malformed entries are skipped.
pub fn decode_typing(conversation_id: &ConversationId, value: Option<&Value>) -> Vec<TypingRecord> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(user, v)| {
            let at = v.get("at")?.as_i64()?;
            Some(TypingRecord {
                conversation_id: conversation_id.clone(),
                user_id: UserId(user.clone()),
                at: ServerTime(at),
            })
        })
        .collect()
}
