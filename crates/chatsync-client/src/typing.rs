//! Who is typing where.
//!
//! Typing records are ephemeral: clients may vanish without clearing them,
//! so the exposed view ignores any record older than the TTL, measured
//! against the store's clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chatsync_remote::Query;
use chatsync_shared::record::{decode_typing, typing_value};
use chatsync_shared::{paths, ConversationId, SyncResult, TypingRecord, UserId};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::events::{EventBus, SyncEvent};
use crate::identity::IdentityProvider;
use crate::{lock, SharedRemote};

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

pub struct TypingTracker {
    remote: SharedRemote,
    identity: Arc<dyn IdentityProvider>,
    events: EventBus,
    config: ClientConfig,
    records: Mutex<HashMap<ConversationId, Vec<TypingRecord>>>,
}

/// Keeps a conversation's typing records flowing into the tracker.
#[derive(Debug)]
pub struct TypingWatch {
    task: JoinHandle<()>,
}

impl Drop for TypingWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TypingTracker {
    pub fn new(
        remote: SharedRemote,
        identity: Arc<dyn IdentityProvider>,
        events: EventBus,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            identity,
            events,
            config,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Write or clear the local user's typing record. A set record is also
    /// cleared by the store if this client disconnects.
    pub async fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) -> SyncResult<()> {
        let user = self.identity.require_user()?;
        let path = paths::typing(conversation_id, &user);
        if is_typing {
            self.remote.register_on_disconnect(&path, Value::Null).await?;
            self.remote.write(&path, typing_value()).await?;
        } else {
            self.remote.write(&path, Value::Null).await?;
            self.remote.cancel_on_disconnect(&path).await?;
        }
        debug!(conversation = %conversation_id, is_typing, "typing updated");
        Ok(())
    }

    /// Other users typing in `conversation_id`, excluding stale records.
    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let me = self.identity.current_user_id();
        let now = self.remote.server_now();
        let mut users: Vec<UserId> = lock(&self.records)
            .get(conversation_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| !r.is_stale(now, self.config.typing_ttl_ms))
                    .filter(|r| Some(&r.user_id) != me.as_ref())
                    .map(|r| r.user_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Follow `conversation_id`'s typing records until the watch drops.
    pub fn watch(self: &Arc<Self>, conversation_id: &ConversationId) -> TypingWatch {
        let tracker = self.clone();
        let conversation_id = conversation_id.clone();
        let task = tokio::spawn(async move {
            let mut backoff = Backoff::from_config(&tracker.config);
            let mut purge = tokio::time::interval(PURGE_INTERVAL);
            loop {
                let mut sub = match tracker
                    .remote
                    .subscribe(&paths::typing_root(&conversation_id), Query::default())
                    .await
                {
                    Ok(sub) => sub,
                    Err(e) => {
                        warn!(conversation = %conversation_id, error = %e, "typing subscribe failed");
                        backoff.wait().await;
                        continue;
                    }
                };
                backoff.reset();
                let mut visible = tracker.typing_users(&conversation_id);
                loop {
                    tokio::select! {
                        snapshot = sub.next() => {
                            let Some(snapshot) = snapshot else { break };
                            let records = decode_typing(&conversation_id, snapshot.value.as_ref());
                            lock(&tracker.records).insert(conversation_id.clone(), records);
                        }
                        _ = purge.tick() => tracker.purge(&conversation_id),
                    }
                    let now_visible = tracker.typing_users(&conversation_id);
                    if now_visible != visible {
                        visible = now_visible;
                        tracker.events.emit(SyncEvent::TypingChanged {
                            conversation_id: conversation_id.clone(),
                        });
                    }
                }
                backoff.wait().await;
            }
        });
        TypingWatch { task }
    }

    fn purge(&self, conversation_id: &ConversationId) {
        let now = self.remote.server_now();
        if let Some(records) = lock(&self.records).get_mut(conversation_id) {
            records.retain(|r| !r.is_stale(now, self.config.typing_ttl_ms));
        }
    }
}
