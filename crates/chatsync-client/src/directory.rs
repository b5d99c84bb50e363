//! Conversation records, cached with a time-to-live, and the membership
//! changes of group conversations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use chatsync_remote::{transact, Query};
use chatsync_shared::record::{self, ConversationRecord};
use chatsync_shared::{
    admin_count, paths, Conversation, ConversationId, ConversationKind, Role, ServerTime,
    SyncError, SyncResult, UserId,
};

use crate::config::ClientConfig;
use crate::{lock, SharedRemote};

struct Cached {
    conversation: Conversation,
    fetched_at: Instant,
}

pub struct ConversationDirectory {
    remote: SharedRemote,
    ttl: Duration,
    transact_retries: u32,
    entries: Mutex<HashMap<ConversationId, Cached>>,
}

impl ConversationDirectory {
    pub fn new(remote: SharedRemote, config: &ClientConfig) -> Self {
        Self {
            remote,
            ttl: config.directory_ttl,
            transact_retries: config.transact_retries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The cached record if younger than the TTL, otherwise a fresh one.
    pub async fn get(&self, conversation_id: &ConversationId) -> SyncResult<Conversation> {
        if let Some(cached) = self.cached(conversation_id) {
            return Ok(cached);
        }
        self.refresh(conversation_id).await
    }

    /// Fetch the record from the store, bypassing the cache.
    pub async fn refresh(&self, conversation_id: &ConversationId) -> SyncResult<Conversation> {
        let snapshot = self
            .remote
            .get(&paths::conversation(conversation_id), Query::default())
            .await?;
        let Some(value) = snapshot.value.filter(|v| !v.is_null()) else {
            self.invalidate(conversation_id);
            return Err(SyncError::ConversationRemoved(conversation_id.clone()));
        };
        let conversation = record::decode_conversation(conversation_id, &value)?;
        self.remember(conversation.clone());
        Ok(conversation)
    }

    pub fn cached(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        lock(&self.entries)
            .get(conversation_id)
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.conversation.clone())
    }

    pub fn invalidate(&self, conversation_id: &ConversationId) {
        lock(&self.entries).remove(conversation_id);
    }

    /// Conversation ids listed for `user`.
    pub async fn conversations_of(&self, user: &UserId) -> SyncResult<Vec<ConversationId>> {
        let snapshot = self
            .remote
            .get(&paths::user_conversations(user), Query::default())
            .await?;
        Ok(match snapshot.value {
            Some(Value::Object(map)) => map.keys().map(|k| ConversationId::new(k.as_str())).collect(),
            _ => Vec::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    pub async fn create_direct(&self, a: &UserId, b: &UserId) -> SyncResult<Conversation> {
        let conversation = Conversation {
            id: ConversationId::new(self.remote.reserve_key("conversations").await?),
            kind: ConversationKind::Direct {
                participants: [a.clone(), b.clone()],
            },
            last_message: None,
            last_message_time: None,
            created_at: ServerTime::default(),
        };
        self.create(conversation).await
    }

    /// A group with `creator` as its admin and `members` as plain members.
    pub async fn create_group(
        &self,
        name: &str,
        creator: &UserId,
        members: &[UserId],
    ) -> SyncResult<Conversation> {
        let mut roles: BTreeMap<UserId, Role> =
            members.iter().map(|m| (m.clone(), Role::Member)).collect();
        roles.insert(creator.clone(), Role::Admin);
        let conversation = Conversation {
            id: ConversationId::new(self.remote.reserve_key("conversations").await?),
            kind: ConversationKind::Group {
                name: name.to_string(),
                members: roles,
            },
            last_message: None,
            last_message_time: None,
            created_at: ServerTime::default(),
        };
        self.create(conversation).await
    }

    async fn create(&self, mut conversation: Conversation) -> SyncResult<Conversation> {
        conversation.validate()?;
        let mut updates = BTreeMap::new();
        updates.insert(
            paths::conversation(&conversation.id),
            ConversationRecord::from_conversation(&conversation).to_write_value()?,
        );
        for member in conversation.members() {
            updates.insert(paths::user_conversation(&member, &conversation.id), json!(true));
        }
        let ack = self.remote.patch(updates).await?;
        conversation.created_at = ack.server_time;
        info!(conversation = %conversation.id, direct = conversation.is_direct(), "conversation created");
        self.remember(conversation.clone());
        Ok(conversation)
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Change `user`'s role. Only admins may do so, and the group must keep
    /// at least one admin.
    pub async fn set_member_role(
        &self,
        actor: &UserId,
        conversation_id: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> SyncResult<()> {
        self.update_members(conversation_id, |members| {
            require_admin(members, actor, conversation_id)?;
            match members.get_mut(user) {
                Some(current) => *current = role,
                None => {
                    return Err(SyncError::NotAMember {
                        user: user.clone(),
                        conversation: conversation_id.clone(),
                    })
                }
            }
            Ok(())
        })
        .await?;
        debug!(conversation = %conversation_id, user = %user, ?role, "member role changed");
        Ok(())
    }

    pub async fn add_member(
        &self,
        actor: &UserId,
        conversation_id: &ConversationId,
        user: &UserId,
    ) -> SyncResult<()> {
        self.update_members(conversation_id, |members| {
            require_admin(members, actor, conversation_id)?;
            members.entry(user.clone()).or_insert(Role::Member);
            Ok(())
        })
        .await?;
        self.remote
            .write(&paths::user_conversation(user, conversation_id), json!(true))
            .await?;
        Ok(())
    }

    /// Remove `user`. Admins may remove anyone; anyone may remove themself.
    pub async fn remove_member(
        &self,
        actor: &UserId,
        conversation_id: &ConversationId,
        user: &UserId,
    ) -> SyncResult<()> {
        self.update_members(conversation_id, |members| {
            if actor != user {
                require_admin(members, actor, conversation_id)?;
            }
            if members.remove(user).is_none() {
                return Err(SyncError::NotAMember {
                    user: user.clone(),
                    conversation: conversation_id.clone(),
                });
            }
            Ok(())
        })
        .await?;
        self.remote
            .write(&paths::user_conversation(user, conversation_id), Value::Null)
            .await?;
        Ok(())
    }

    /// One transaction over the whole `members` subtree, so concurrent
    /// changes can never leave the group without an admin.
    async fn update_members<F>(&self, conversation_id: &ConversationId, mut change: F) -> SyncResult<()>
    where
        F: FnMut(&mut BTreeMap<UserId, Role>) -> SyncResult<()> + Send,
    {
        if self.get(conversation_id).await?.is_direct() {
            return Err(SyncError::NotPermitted(format!(
                "direct conversation {conversation_id} has no roles"
            )));
        }
        let committed = transact(
            self.remote.as_ref(),
            &paths::members(conversation_id),
            self.transact_retries,
            |current| {
                let mut members = record::decode_members(current)?;
                if members.is_empty() {
                    return Err(SyncError::ConversationRemoved(conversation_id.clone()));
                }
                change(&mut members)?;
                if admin_count(&members) == 0 {
                    return Err(SyncError::LastAdmin(conversation_id.clone()));
                }
                Ok(Some(record::encode_members(&members)?))
            },
        )
        .await?;
        debug!(conversation = %conversation_id, attempts = committed.attempts, "members updated");
        self.invalidate(conversation_id);
        Ok(())
    }

    fn remember(&self, conversation: Conversation) {
        lock(&self.entries).insert(
            conversation.id.clone(),
            Cached {
                conversation,
                fetched_at: Instant::now(),
            },
        );
    }
}

fn require_admin(
    members: &BTreeMap<UserId, Role>,
    actor: &UserId,
    conversation_id: &ConversationId,
) -> SyncResult<()> {
    match members.get(actor) {
        Some(Role::Admin) => Ok(()),
        Some(Role::Member) => Err(SyncError::NotPermitted(format!(
            "{actor} is not an admin of {conversation_id}"
        ))),
        None => Err(SyncError::NotAMember {
            user: actor.clone(),
            conversation: conversation_id.clone(),
        }),
    }
}
