//! Send eligibility and presence visibility across block relations.
//!
//! Every decision reads the store directly; block edges and membership are
//! never served from a cache.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use chatsync_remote::Query;
use chatsync_shared::{paths, ConversationId, SyncError, SyncResult, UserId};

use crate::directory::ConversationDirectory;
use crate::SharedRemote;

pub struct BlockGuard {
    remote: SharedRemote,
    directory: Arc<ConversationDirectory>,
}

impl BlockGuard {
    pub fn new(remote: SharedRemote, directory: Arc<ConversationDirectory>) -> Self {
        Self { remote, directory }
    }

    /// `Ok` if `sender` may post into `conversation_id` right now.
    ///
    /// Direct conversations deny with `Blocked` when the counterpart has
    /// blocked the sender; groups deny with `NotAMember` when the sender is
    /// not a current member.
    pub async fn can_send(&self, sender: &UserId, conversation_id: &ConversationId) -> SyncResult<()> {
        let conversation = self.directory.refresh(conversation_id).await?;
        if conversation.is_direct() {
            let Some(counterpart) = conversation.counterpart(sender) else {
                return Err(not_a_member(sender, conversation_id));
            };
            if self.is_blocked(counterpart, sender).await? {
                debug!(sender = %sender, conversation = %conversation_id, "send denied: blocked");
                return Err(SyncError::Blocked {
                    sender: sender.clone(),
                    conversation: conversation_id.clone(),
                });
            }
        } else if !conversation.is_member(sender) {
            debug!(sender = %sender, conversation = %conversation_id, "send denied: not a member");
            return Err(not_a_member(sender, conversation_id));
        }
        Ok(())
    }

    /// Whether `viewer` may see `user`'s presence: not if either has
    /// blocked the other. History is unaffected.
    pub async fn is_visible(&self, user: &UserId, viewer: &UserId) -> SyncResult<bool> {
        if user == viewer {
            return Ok(true);
        }
        let (a, b) = tokio::try_join!(self.is_blocked(user, viewer), self.is_blocked(viewer, user))?;
        Ok(!a && !b)
    }

    pub async fn is_blocked(&self, blocker: &UserId, blocked: &UserId) -> SyncResult<bool> {
        let snapshot = self
            .remote
            .get(&paths::block(blocker, blocked), Query::default())
            .await?;
        Ok(snapshot.exists())
    }

    pub async fn block(&self, blocker: &UserId, blocked: &UserId) -> SyncResult<()> {
        self.remote
            .write(&paths::block(blocker, blocked), json!(true))
            .await?;
        info!(blocker = %blocker, blocked = %blocked, "user blocked");
        Ok(())
    }

    pub async fn unblock(&self, blocker: &UserId, blocked: &UserId) -> SyncResult<()> {
        self.remote
            .write(&paths::block(blocker, blocked), Value::Null)
            .await?;
        info!(blocker = %blocker, blocked = %blocked, "user unblocked");
        Ok(())
    }
}

fn not_a_member(user: &UserId, conversation_id: &ConversationId) -> SyncError {
    SyncError::NotAMember {
        user: user.clone(),
        conversation: conversation_id.clone(),
    }
}
