//! Optimistic send queue.
//!
//! `enqueue` puts a pending copy of the message into the cache straight
//! away and hands the entry to the conversation's worker task. Workers
//! deliver strictly in submission order: a failed head holds back the
//! entries behind it until it is retried or discarded. Entries are mirrored
//! into the local database and restored on start.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use chatsync_remote::{increment, server_timestamp_placeholder, Query};
use chatsync_shared::constants::CONFIRMED_RETENTION;
use chatsync_shared::record::MessageRecord;
use chatsync_shared::{
    paths, ConversationId, Draft, Message, OutboxEntry, OutboxState, ServerTime, SyncError,
    SyncResult, TempId,
};

use crate::backoff::Backoff;
use crate::cache::MessageCache;
use crate::config::ClientConfig;
use crate::directory::ConversationDirectory;
use crate::events::{EventBus, SyncEvent};
use crate::guard::BlockGuard;
use crate::identity::IdentityProvider;
use crate::{lock, wait_connected, LocalStore, SharedRemote};

#[derive(Default)]
struct Queues {
    entries: HashMap<TempId, OutboxEntry>,
    fifo: HashMap<ConversationId, VecDeque<TempId>>,
    workers: HashMap<ConversationId, Arc<Notify>>,
    confirmed: HashSet<TempId>,
    /// Delivery order of `confirmed`, oldest first.
    confirmed_order: VecDeque<TempId>,
}

impl Queues {
    fn knows(&self, temp_id: &TempId) -> bool {
        self.entries.contains_key(temp_id) || self.confirmed.contains(temp_id)
    }

    fn remember_confirmed(&mut self, temp_id: TempId) {
        if !self.confirmed.insert(temp_id) {
            return;
        }
        self.confirmed_order.push_back(temp_id);
        while self.confirmed_order.len() > CONFIRMED_RETENTION {
            if let Some(oldest) = self.confirmed_order.pop_front() {
                self.confirmed.remove(&oldest);
            }
        }
    }
}

/// What became of one delivery attempt.
enum Attempt {
    /// Confirmed, failed for good, or the entry went away.
    Settled,
    /// Transient failure while connected; back off before the next try.
    Retry,
    /// Connection lost mid-send; wait for it to return.
    Held,
}

pub struct Outbox {
    remote: SharedRemote,
    identity: Arc<dyn IdentityProvider>,
    guard: Arc<BlockGuard>,
    directory: Arc<ConversationDirectory>,
    cache: Arc<MessageCache>,
    local: Option<LocalStore>,
    events: EventBus,
    config: ClientConfig,
    queues: Mutex<Queues>,
}

impl Outbox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: SharedRemote,
        identity: Arc<dyn IdentityProvider>,
        guard: Arc<BlockGuard>,
        directory: Arc<ConversationDirectory>,
        cache: Arc<MessageCache>,
        local: Option<LocalStore>,
        events: EventBus,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            identity,
            guard,
            directory,
            cache,
            local,
            events,
            config,
            queues: Mutex::new(Queues::default()),
        })
    }

    /// Queue `draft` for delivery and show it in the cache immediately.
    ///
    /// A definite refusal by the block guard (or an absent reply target)
    /// fails right here without any write. When eligibility cannot be
    /// checked, e.g. offline, the check happens again at delivery.
    pub async fn enqueue(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        draft: Draft,
    ) -> SyncResult<TempId> {
        self.enqueue_with_id(conversation_id, draft, TempId::new())
            .await
    }

    /// As [`Outbox::enqueue`] with a caller-chosen temp id. Enqueueing an id
    /// the outbox already knows is a no-op.
    pub async fn enqueue_with_id(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        draft: Draft,
        temp_id: TempId,
    ) -> SyncResult<TempId> {
        let sender = self.identity.require_user()?;
        let known = lock(&self.queues).knows(&temp_id);
        if known || self.delivered_earlier(temp_id) {
            debug!(temp_id = %temp_id, "duplicate enqueue ignored");
            return Ok(temp_id);
        }

        match self.guard.can_send(&sender, conversation_id).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                debug!(conversation = %conversation_id, error = %e, "eligibility deferred to delivery");
            }
            Err(e) => return Err(e),
        }
        if let Some(target) = &draft.reply_to {
            match self.reply_target_exists(conversation_id, target).await {
                Ok(true) => {}
                Ok(false) => return Err(SyncError::InvalidReply(target.clone())),
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }
        }

        let entry = OutboxEntry {
            temp_id,
            conversation_id: conversation_id.clone(),
            sender_id: sender.clone(),
            draft,
            created_at_client: self.remote.server_now(),
            reserved_id: None,
            retry_count: 0,
            last_error: None,
            state: OutboxState::Pending,
        };
        {
            let mut queues = lock(&self.queues);
            if queues.knows(&temp_id) {
                return Ok(temp_id);
            }
            queues.entries.insert(temp_id, entry.clone());
            queues
                .fifo
                .entry(conversation_id.clone())
                .or_default()
                .push_back(temp_id);
        }
        self.store(|db| db.insert_outbox_entry(&entry));
        self.cache.insert_local(Message::local(
            temp_id,
            conversation_id.clone(),
            sender,
            entry.created_at_client,
            &entry.draft,
        ));
        self.emit_state(&entry);
        info!(conversation = %conversation_id, temp_id = %temp_id, "message enqueued");
        self.kick(conversation_id);
        Ok(temp_id)
    }

    /// Put a failed entry back in line. Confirmed entries are never re-sent.
    pub fn retry(self: &Arc<Self>, temp_id: TempId) -> SyncResult<()> {
        if self.is_confirmed(temp_id) {
            return Ok(());
        }
        let entry = {
            let mut queues = lock(&self.queues);
            let entry = queues
                .entries
                .get_mut(&temp_id)
                .ok_or_else(|| SyncError::NotFound(temp_id.to_string()))?;
            if entry.state != OutboxState::Failed {
                return Ok(());
            }
            entry.state = OutboxState::Pending;
            entry.clone()
        };
        info!(temp_id = %temp_id, retries = entry.retry_count, "retrying message");
        self.store(|db| db.update_outbox_entry(&entry).map(|_| ()));
        self.emit_state(&entry);
        self.kick(&entry.conversation_id);
        Ok(())
    }

    /// Drop a pending or failed entry and its pending copy in the cache.
    pub fn discard(self: &Arc<Self>, temp_id: TempId) -> SyncResult<()> {
        if self.is_confirmed(temp_id) {
            return Err(SyncError::NotPermitted(format!("{temp_id} is already delivered")));
        }
        let conversation_id = {
            let mut queues = lock(&self.queues);
            let entry = queues
                .entries
                .get(&temp_id)
                .ok_or_else(|| SyncError::NotFound(temp_id.to_string()))?;
            if entry.state == OutboxState::Sending {
                return Err(SyncError::NotPermitted(format!("{temp_id} is being sent")));
            }
            let conversation_id = entry.conversation_id.clone();
            queues.entries.remove(&temp_id);
            if let Some(fifo) = queues.fifo.get_mut(&conversation_id) {
                fifo.retain(|id| *id != temp_id);
            }
            conversation_id
        };
        info!(temp_id = %temp_id, "message discarded");
        self.store(|db| db.delete_outbox_entry(temp_id).map(|_| ()));
        self.cache.remove_local(&conversation_id, temp_id);
        self.kick(&conversation_id);
        Ok(())
    }

    /// Reload unconfirmed entries persisted by a previous run and resume
    /// their delivery. Entries caught mid-send go back to pending.
    pub fn restore(self: &Arc<Self>) -> SyncResult<usize> {
        let Some(local) = &self.local else {
            return Ok(0);
        };
        let stored = lock(local).list_outbox_entries()?;
        let mut restored = Vec::new();
        {
            let mut queues = lock(&self.queues);
            for mut entry in stored {
                if queues.knows(&entry.temp_id) {
                    continue;
                }
                if entry.state == OutboxState::Sending {
                    entry.state = OutboxState::Pending;
                }
                queues.entries.insert(entry.temp_id, entry.clone());
                queues
                    .fifo
                    .entry(entry.conversation_id.clone())
                    .or_default()
                    .push_back(entry.temp_id);
                restored.push(entry);
            }
        }

        let mut conversations = HashSet::new();
        for entry in &restored {
            self.cache.insert_local(Message::local(
                entry.temp_id,
                entry.conversation_id.clone(),
                entry.sender_id.clone(),
                entry.created_at_client,
                &entry.draft,
            ));
            conversations.insert(entry.conversation_id.clone());
        }
        for conversation_id in &conversations {
            self.kick(conversation_id);
        }
        if !restored.is_empty() {
            info!(count = restored.len(), "restored outbox entries");
        }
        Ok(restored.len())
    }

    pub fn state(&self, temp_id: TempId) -> Option<OutboxState> {
        if self.is_confirmed(temp_id) {
            return Some(OutboxState::Confirmed);
        }
        lock(&self.queues).entries.get(&temp_id).map(|e| e.state)
    }

    /// Delivered, in this run or in an earlier one sharing the database.
    fn is_confirmed(&self, temp_id: TempId) -> bool {
        let in_memory = lock(&self.queues).confirmed.contains(&temp_id);
        in_memory || self.delivered_earlier(temp_id)
    }

    fn delivered_earlier(&self, temp_id: TempId) -> bool {
        let Some(local) = &self.local else {
            return false;
        };
        match lock(local).is_outbox_confirmed(temp_id) {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(temp_id = %temp_id, error = %e, "failed to look up delivered entry");
                false
            }
        }
    }

    pub fn entry(&self, temp_id: TempId) -> Option<OutboxEntry> {
        lock(&self.queues).entries.get(&temp_id).cloned()
    }

    /// Undelivered entries of a conversation in submission order.
    pub fn pending(&self, conversation_id: &ConversationId) -> Vec<OutboxEntry> {
        let queues = lock(&self.queues);
        queues
            .fifo
            .get(conversation_id)
            .map(|fifo| {
                fifo.iter()
                    .filter_map(|id| queues.entries.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    /// Wake the conversation's worker, starting one if needed.
    fn kick(self: &Arc<Self>, conversation_id: &ConversationId) {
        let mut queues = lock(&self.queues);
        if let Some(notify) = queues.workers.get(conversation_id) {
            notify.notify_one();
            return;
        }
        let notify = Arc::new(Notify::new());
        queues
            .workers
            .insert(conversation_id.clone(), notify.clone());
        drop(queues);

        let outbox = self.clone();
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move { outbox.run_worker(conversation_id, notify).await });
    }

    async fn run_worker(self: Arc<Self>, conversation_id: ConversationId, notify: Arc<Notify>) {
        debug!(conversation = %conversation_id, "outbox worker started");
        let mut backoff = Backoff::from_config(&self.config);
        let mut current: Option<TempId> = None;

        loop {
            let head = {
                let mut queues = lock(&self.queues);
                let head = queues
                    .fifo
                    .get(&conversation_id)
                    .and_then(|fifo| fifo.front().copied());
                match head {
                    None => {
                        queues.fifo.remove(&conversation_id);
                        queues.workers.remove(&conversation_id);
                        debug!(conversation = %conversation_id, "outbox worker idle");
                        return;
                    }
                    Some(id) => match queues.entries.get(&id) {
                        Some(entry) => entry.clone(),
                        None => {
                            if let Some(fifo) = queues.fifo.get_mut(&conversation_id) {
                                fifo.pop_front();
                            }
                            continue;
                        }
                    },
                }
            };

            if head.state == OutboxState::Failed {
                current = None;
                notify.notified().await;
                continue;
            }

            if !*self.remote.connection_state().borrow() {
                debug!(conversation = %conversation_id, queued = ?head.temp_id, "offline, holding queue");
                tokio::select! {
                    connected = wait_connected(self.remote.as_ref()) => {
                        if !connected {
                            warn!(conversation = %conversation_id, "store gone, stopping outbox worker");
                            lock(&self.queues).workers.remove(&conversation_id);
                            return;
                        }
                    }
                    _ = notify.notified() => {}
                }
                continue;
            }

            if current != Some(head.temp_id) {
                current = Some(head.temp_id);
                backoff.reset();
            }
            match self.deliver(head.temp_id, backoff.attempt()).await {
                Attempt::Settled => backoff.reset(),
                Attempt::Retry => backoff.wait().await,
                Attempt::Held => {}
            }
        }
    }

    async fn deliver(&self, temp_id: TempId, failures: u32) -> Attempt {
        let Some(entry) = self.transition(temp_id, OutboxState::Sending, None) else {
            return Attempt::Settled;
        };

        let outcome = tokio::time::timeout(self.config.ack_timeout, self.send_once(&entry)).await;
        let connected = *self.remote.connection_state().borrow();
        match outcome {
            Ok(Ok((key, at))) => {
                self.confirm(&entry, key, at);
                Attempt::Settled
            }
            Ok(Err(e)) if e.is_retryable() => {
                if !connected {
                    debug!(temp_id = %temp_id, error = %e, "send interrupted by disconnect");
                    self.transition(temp_id, OutboxState::Pending, Some(&e));
                    Attempt::Held
                } else if failures + 1 >= self.config.max_send_attempts {
                    warn!(temp_id = %temp_id, error = %e, "send failed, giving up until retried");
                    self.transition(temp_id, OutboxState::Failed, Some(&e));
                    Attempt::Settled
                } else {
                    debug!(temp_id = %temp_id, error = %e, failures, "send failed, backing off");
                    self.transition(temp_id, OutboxState::Pending, Some(&e));
                    Attempt::Retry
                }
            }
            Ok(Err(e)) => {
                warn!(temp_id = %temp_id, error = %e, "send rejected");
                self.transition(temp_id, OutboxState::Failed, Some(&e));
                Attempt::Settled
            }
            Err(_) if !connected => {
                let e = SyncError::TransientNetwork("connection lost while sending".into());
                self.transition(temp_id, OutboxState::Pending, Some(&e));
                Attempt::Held
            }
            Err(_) => {
                let timeout = SyncError::AckTimeout(self.config.ack_timeout.as_millis() as u64);
                warn!(temp_id = %temp_id, "send not acknowledged in time");
                self.transition(temp_id, OutboxState::Failed, Some(&timeout));
                Attempt::Settled
            }
        }
    }

    /// One delivery attempt. Returns the message key and its server time.
    async fn send_once(&self, entry: &OutboxEntry) -> SyncResult<(String, ServerTime)> {
        let conversation_id = &entry.conversation_id;

        // An earlier attempt may have landed without its ack reaching us.
        if let Some(key) = &entry.reserved_id {
            if let Some(at) = self.landed(conversation_id, key).await? {
                debug!(temp_id = %entry.temp_id, key = %key, "earlier attempt already landed");
                return Ok((key.clone(), at));
            }
        }

        self.guard.can_send(&entry.sender_id, conversation_id).await?;
        if let Some(target) = &entry.draft.reply_to {
            if !self.reply_target_exists(conversation_id, target).await? {
                return Err(SyncError::InvalidReply(target.clone()));
            }
        }

        let key = match &entry.reserved_id {
            Some(key) => key.clone(),
            None => {
                let key = self
                    .remote
                    .reserve_key(&paths::messages(conversation_id))
                    .await?;
                self.reserve(entry.temp_id, &key);
                key
            }
        };

        let conversation = self.directory.get(conversation_id).await?;
        let body = &entry.draft.body;
        let record = MessageRecord::new(
            &entry.sender_id,
            entry.created_at_client,
            body,
            entry.draft.reply_to.as_deref(),
        );

        let conversation_path = paths::conversation(conversation_id);
        let mut updates = BTreeMap::new();
        updates.insert(paths::message(conversation_id, &key), record.to_write_value()?);
        updates.insert(format!("{conversation_path}/lastMessage"), json!(body.preview()));
        updates.insert(
            format!("{conversation_path}/lastMessageTime"),
            server_timestamp_placeholder(),
        );
        if !body.is_system() {
            for member in conversation.members() {
                if member != entry.sender_id {
                    updates.insert(paths::unread(&member, conversation_id), increment(1));
                }
            }
        }

        let ack = self.remote.patch(updates).await?;
        Ok((key, ack.server_time))
    }

    async fn landed(&self, conversation_id: &ConversationId, key: &str) -> SyncResult<Option<ServerTime>> {
        let snapshot = self
            .remote
            .get(&paths::message(conversation_id, key), Query::default())
            .await?;
        Ok(snapshot
            .value
            .as_ref()
            .and_then(|v| v.get("createdAtServer"))
            .and_then(|v| v.as_i64())
            .map(ServerTime))
    }

    async fn reply_target_exists(&self, conversation_id: &ConversationId, target: &str) -> SyncResult<bool> {
        if self.cache.has_confirmed(conversation_id, target) {
            return Ok(true);
        }
        let snapshot = self
            .remote
            .get(&paths::message(conversation_id, target), Query::default())
            .await?;
        Ok(snapshot.exists())
    }

    // -----------------------------------------------------------------------
    // State bookkeeping
    // -----------------------------------------------------------------------

    fn confirm(&self, entry: &OutboxEntry, key: String, at: ServerTime) {
        let temp_id = entry.temp_id;
        let conversation_id = &entry.conversation_id;
        {
            let mut queues = lock(&self.queues);
            queues.entries.remove(&temp_id);
            queues.remember_confirmed(temp_id);
            if let Some(fifo) = queues.fifo.get_mut(conversation_id) {
                fifo.retain(|id| *id != temp_id);
            }
        }
        self.store(|db| {
            db.confirm_outbox_entry(temp_id, CONFIRMED_RETENTION)
                .map(|_| ())
        });
        self.cache.confirm_local(conversation_id, temp_id, &key, at);
        info!(conversation = %conversation_id, temp_id = %temp_id, key = %key, "message confirmed");
        self.events.emit(SyncEvent::OutboxChanged {
            conversation_id: conversation_id.clone(),
            temp_id,
            state: OutboxState::Confirmed,
        });
        self.events.emit(SyncEvent::MessageConfirmed {
            conversation_id: conversation_id.clone(),
            temp_id,
            message_id: key,
        });
    }

    /// Move an entry to `state`, counting failures. `None` if the entry is
    /// gone.
    fn transition(
        &self,
        temp_id: TempId,
        state: OutboxState,
        error: Option<&SyncError>,
    ) -> Option<OutboxEntry> {
        let entry = {
            let mut queues = lock(&self.queues);
            let entry = queues.entries.get_mut(&temp_id)?;
            entry.state = state;
            if let Some(e) = error {
                entry.retry_count += 1;
                entry.last_error = Some(e.to_string());
            }
            entry.clone()
        };
        self.store(|db| db.update_outbox_entry(&entry).map(|_| ()));
        self.emit_state(&entry);
        Some(entry)
    }

    fn reserve(&self, temp_id: TempId, key: &str) {
        let entry = {
            let mut queues = lock(&self.queues);
            let Some(entry) = queues.entries.get_mut(&temp_id) else {
                return;
            };
            entry.reserved_id = Some(key.to_string());
            entry.clone()
        };
        self.store(|db| db.update_outbox_entry(&entry).map(|_| ()));
    }

    fn emit_state(&self, entry: &OutboxEntry) {
        self.events.emit(SyncEvent::OutboxChanged {
            conversation_id: entry.conversation_id.clone(),
            temp_id: entry.temp_id,
            state: entry.state,
        });
    }

    fn store(&self, op: impl FnOnce(&chatsync_store::Database) -> chatsync_store::Result<()>) {
        let Some(local) = &self.local else {
            return;
        };
        if let Err(e) = op(&lock(local)) {
            warn!(error = %e, "failed to persist outbox entry");
        }
    }
}
