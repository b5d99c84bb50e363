//! Read markers, per-message read receipts and unread counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chatsync_remote::Query;
use chatsync_shared::record::server_timestamp;
use chatsync_shared::{paths, ConversationId, ServerTime, SyncResult};

use crate::backoff::Backoff;
use crate::cache::MessageCache;
use crate::config::ClientConfig;
use crate::events::{EventBus, SyncEvent};
use crate::identity::IdentityProvider;
use crate::{lock, SharedRemote};

pub struct ReadTracker {
    remote: SharedRemote,
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<MessageCache>,
    events: EventBus,
    config: ClientConfig,
    counts: Mutex<HashMap<ConversationId, u64>>,
}

/// Keeps the local user's unread counters flowing into the tracker.
#[derive(Debug)]
pub struct UnreadWatch {
    task: JoinHandle<()>,
}

impl Drop for UnreadWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ReadTracker {
    pub fn new(
        remote: SharedRemote,
        identity: Arc<dyn IdentityProvider>,
        cache: Arc<MessageCache>,
        events: EventBus,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            identity,
            cache,
            events,
            config,
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// Mark everything in `conversation_id` read by the local user.
    ///
    /// One multi-path write moves the read marker, zeroes the unread counter
    /// and adds a receipt to every loaded message from someone else that the
    /// user has not read yet. Calling it again changes nothing visible.
    pub async fn mark_read(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        let viewer = self.identity.require_user()?;
        let keys: Vec<String> = self
            .cache
            .loaded_confirmed(conversation_id)
            .into_iter()
            .filter(|m| m.sender_id != viewer && !m.read_by.contains_key(&viewer))
            .filter_map(|m| m.id.as_confirmed().map(str::to_string))
            .collect();

        let mut updates = BTreeMap::new();
        updates.insert(paths::read_marker(&viewer, conversation_id), server_timestamp());
        updates.insert(paths::unread(&viewer, conversation_id), json!(0));
        for key in &keys {
            updates.insert(
                format!("{}/readBy/{}", paths::message(conversation_id, key), viewer),
                server_timestamp(),
            );
        }
        let ack = self.remote.patch(updates).await?;
        debug!(conversation = %conversation_id, receipts = keys.len(), "marked read");

        self.cache
            .apply_read(conversation_id, &viewer, &keys, ack.server_time);
        let previous = lock(&self.counts).insert(conversation_id.clone(), 0);
        if previous != Some(0) {
            self.events.emit(SyncEvent::UnreadChanged {
                conversation_id: conversation_id.clone(),
                count: 0,
            });
        }
        Ok(())
    }

    /// The local user's unread count for `conversation_id`, read from the
    /// store.
    pub async fn unread_count(&self, conversation_id: &ConversationId) -> SyncResult<u64> {
        let viewer = self.identity.require_user()?;
        let snapshot = self
            .remote
            .get(&paths::unread(&viewer, conversation_id), Query::default())
            .await?;
        let count = snapshot.value.as_ref().map(count_of).unwrap_or(0);
        lock(&self.counts).insert(conversation_id.clone(), count);
        Ok(count)
    }

    /// When the local user last marked `conversation_id` read.
    pub async fn read_marker(&self, conversation_id: &ConversationId) -> SyncResult<Option<ServerTime>> {
        let viewer = self.identity.require_user()?;
        let snapshot = self
            .remote
            .get(&paths::read_marker(&viewer, conversation_id), Query::default())
            .await?;
        Ok(snapshot.value.and_then(|v| v.as_i64()).map(ServerTime))
    }

    /// Last known counters, as maintained by [`ReadTracker::watch_unread`].
    pub fn unread_counts(&self) -> HashMap<ConversationId, u64> {
        lock(&self.counts).clone()
    }

    /// Follow every unread counter of the local user until the watch drops.
    pub fn watch_unread(self: &Arc<Self>) -> SyncResult<UnreadWatch> {
        let viewer = self.identity.require_user()?;
        let tracker = self.clone();
        let task = tokio::spawn(async move {
            let mut backoff = Backoff::from_config(&tracker.config);
            loop {
                let mut sub = match tracker
                    .remote
                    .subscribe(&paths::unread_root(&viewer), Query::default())
                    .await
                {
                    Ok(sub) => sub,
                    Err(e) => {
                        warn!(error = %e, "unread subscribe failed");
                        backoff.wait().await;
                        continue;
                    }
                };
                backoff.reset();
                while let Some(snapshot) = sub.next().await {
                    tracker.apply_counts(snapshot.value.as_ref());
                }
                backoff.wait().await;
            }
        });
        Ok(UnreadWatch { task })
    }

    fn apply_counts(&self, value: Option<&Value>) {
        let fresh: HashMap<ConversationId, u64> = match value {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (ConversationId::new(k.as_str()), count_of(v)))
                .collect(),
            _ => HashMap::new(),
        };
        let changed: Vec<(ConversationId, u64)> = {
            let mut counts = lock(&self.counts);
            let mut changed: Vec<(ConversationId, u64)> = fresh
                .iter()
                .filter(|(c, n)| counts.get(*c) != Some(*n))
                .map(|(c, n)| (c.clone(), *n))
                .collect();
            // Counters removed from the store read as zero.
            changed.extend(
                counts
                    .iter()
                    .filter(|(c, n)| **n != 0 && !fresh.contains_key(*c))
                    .map(|(c, _)| (c.clone(), 0)),
            );
            for (c, n) in &changed {
                counts.insert(c.clone(), *n);
            }
            changed
        };
        for (conversation_id, count) in changed {
            self.events.emit(SyncEvent::UnreadChanged {
                conversation_id,
                count,
            });
        }
    }
}

fn count_of(value: &Value) -> u64 {
    value.as_i64().map(|n| n.max(0) as u64).unwrap_or(0)
}
