//! Edits, soft deletes and reactions on confirmed messages.
//!
//! Each action is a transaction on the message (or on one reaction flag),
//! so concurrent edits from several devices serialize instead of
//! overwriting each other blindly.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use chatsync_remote::{transact, Query};
use chatsync_shared::record::{server_timestamp, MessageRecord};
use chatsync_shared::{paths, ConversationId, MessageBody, SyncError, SyncResult, UserId};

use crate::config::ClientConfig;
use crate::identity::IdentityProvider;
use crate::SharedRemote;

pub struct MessageActions {
    remote: SharedRemote,
    identity: Arc<dyn IdentityProvider>,
    transact_retries: u32,
}

impl MessageActions {
    pub fn new(remote: SharedRemote, identity: Arc<dyn IdentityProvider>, config: &ClientConfig) -> Self {
        Self {
            remote,
            identity,
            transact_retries: config.transact_retries,
        }
    }

    /// Replace the body of one of the local user's messages.
    pub async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        key: &str,
        body: MessageBody,
    ) -> SyncResult<()> {
        let me = self.identity.require_user()?;
        let path = paths::message(conversation_id, key);
        transact(self.remote.as_ref(), &path, self.transact_retries, |current| {
            let mut record = own_live_record(current, &me, key)?;
            record.body = Some(body.clone());
            record.edited = true;
            Ok(Some(serde_json::to_value(&record)?))
        })
        .await?;
        info!(conversation = %conversation_id, message = key, "message edited");
        Ok(())
    }

    /// Soft delete: the body and reactions go, a tombstone stays in place.
    pub async fn delete_message(&self, conversation_id: &ConversationId, key: &str) -> SyncResult<()> {
        let me = self.identity.require_user()?;
        let path = paths::message(conversation_id, key);
        transact(self.remote.as_ref(), &path, self.transact_retries, |current| {
            let mut record = own_live_record(current, &me, key)?;
            record.body = None;
            record.reactions.clear();
            record.deleted = true;
            record.deleted_by = Some(me.0.clone());
            record.deleted_at = None;
            let mut value = serde_json::to_value(&record)?;
            if let Value::Object(map) = &mut value {
                map.insert("deletedAt".to_string(), server_timestamp());
            }
            Ok(Some(value))
        })
        .await?;
        info!(conversation = %conversation_id, message = key, "message deleted");
        Ok(())
    }

    /// Add the local user's `emoji` reaction, or remove it if present.
    /// Returns whether the reaction is now set.
    pub async fn toggle_reaction(
        &self,
        conversation_id: &ConversationId,
        key: &str,
        emoji: &str,
    ) -> SyncResult<bool> {
        let me = self.identity.require_user()?;
        if emoji.is_empty() || emoji.contains('/') {
            return Err(SyncError::NotPermitted(format!("invalid reaction {emoji:?}")));
        }
        let message_path = paths::message(conversation_id, key);
        let snapshot = self.remote.get(&message_path, Query::default()).await?;
        let Some(value) = snapshot.value.filter(|v| !v.is_null()) else {
            return Err(SyncError::NotFound(message_path));
        };
        let record: MessageRecord = serde_json::from_value(value)?;
        if record.deleted {
            return Err(SyncError::NotPermitted(format!("message {key} is deleted")));
        }

        let path = format!("{message_path}/reactions/{me}/{emoji}");
        let committed = transact(self.remote.as_ref(), &path, self.transact_retries, |current| {
            Ok(match current {
                Some(Value::Bool(true)) => None,
                _ => Some(json!(true)),
            })
        })
        .await?;
        Ok(committed.value.is_some())
    }
}

/// The record at `current`, provided it exists, is not deleted and was
/// sent by `me`.
fn own_live_record(current: Option<&Value>, me: &UserId, key: &str) -> SyncResult<MessageRecord> {
    let Some(value) = current.filter(|v| !v.is_null()) else {
        return Err(SyncError::NotFound(format!("message {key}")));
    };
    let record: MessageRecord = serde_json::from_value(value.clone())?;
    if record.sender_id != me.0 {
        return Err(SyncError::NotPermitted(format!("{me} did not send message {key}")));
    }
    if record.deleted {
        return Err(SyncError::NotPermitted(format!("message {key} is deleted")));
    }
    Ok(record)
}
