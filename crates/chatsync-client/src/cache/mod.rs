//! Local message cache and pager.
//!
//! One [`MessageWindow`] per conversation, fed by an initial page, by a
//! live subscription consumed in its own task, by older pages on demand
//! and by the outbox's optimistic inserts. Confirmed messages are mirrored
//! into the local database so a window can be served while the store is
//! unreachable.

pub mod window;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatsync_remote::{Query, Snapshot};
use chatsync_shared::{paths, record};
use chatsync_shared::{
    ConversationId, Message, MessageId, ServerTime, SyncError, SyncResult, TempId, UserId,
};
use chatsync_store::StoreError;

pub use window::MessageWindow;

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::events::{EventBus, SyncEvent};
use crate::{lock, wait_connected, LocalStore, SharedRemote};

const ORDER_FIELD: &str = "createdAtServer";

/// How the initial window was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    /// Fetched from the store; live updates are flowing.
    Live,
    /// Served from the local database while the store is unreachable. The
    /// handle keeps retrying and reports progress as events.
    Offline,
    /// The conversation no longer exists.
    Removed,
}

pub struct WindowLoad {
    pub messages: Vec<Message>,
    pub status: WindowStatus,
    pub handle: WindowHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlderPage {
    /// Ascending, none of them previously cached.
    pub messages: Vec<Message>,
    /// No history older than these remains.
    pub exhausted: bool,
}

/// Keeps a conversation's live feed running. Dropping or closing it stops
/// cache delivery for that conversation; outbox deliveries are unaffected.
#[derive(Debug)]
pub struct WindowHandle {
    conversation_id: ConversationId,
    task: Option<JoinHandle<()>>,
}

impl WindowHandle {
    fn inert(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            task: None,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn close(self) {}
}

impl Drop for WindowHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!(conversation = %self.conversation_id, "closing window");
            task.abort();
        }
    }
}

enum Fetched {
    Page(Vec<Message>),
    Removed,
}

#[derive(Default)]
struct CacheState {
    windows: HashMap<ConversationId, MessageWindow>,
    removed: HashSet<ConversationId>,
}

pub struct MessageCache {
    remote: SharedRemote,
    local: Option<LocalStore>,
    events: EventBus,
    config: ClientConfig,
    state: Mutex<CacheState>,
}

impl MessageCache {
    pub fn new(
        remote: SharedRemote,
        local: Option<LocalStore>,
        events: EventBus,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            local,
            events,
            config,
            state: Mutex::new(CacheState::default()),
        })
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// The newest `page_size` confirmed messages (plus local pending ones),
    /// ascending, and a handle on the live feed for newer ones.
    ///
    /// Never fails: an unreachable store yields the locally persisted
    /// window while the handle keeps retrying in the background.
    pub async fn load_initial_window(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        page_size: usize,
    ) -> WindowLoad {
        let page_size = page_size.max(1);
        match self.fetch_latest(conversation_id, page_size).await {
            Ok(Fetched::Removed) => {
                self.mark_removed(conversation_id);
                WindowLoad {
                    messages: Vec::new(),
                    status: WindowStatus::Removed,
                    handle: WindowHandle::inert(conversation_id.clone()),
                }
            }
            Ok(Fetched::Page(page)) => {
                info!(conversation = %conversation_id, count = page.len(), "loaded initial window");
                let messages = self.install_page(conversation_id, page);
                let cache = self.clone();
                let conv = conversation_id.clone();
                let task = tokio::spawn(async move { cache.run_live(conv).await });
                WindowLoad {
                    messages,
                    status: WindowStatus::Live,
                    handle: WindowHandle {
                        conversation_id: conversation_id.clone(),
                        task: Some(task),
                    },
                }
            }
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "store unreachable, serving local window");
                let messages = self.install_local(conversation_id, page_size);
                let cache = self.clone();
                let conv = conversation_id.clone();
                let task = tokio::spawn(async move {
                    if cache.recover(&conv, page_size).await {
                        cache.run_live(conv).await;
                    }
                });
                WindowLoad {
                    messages,
                    status: WindowStatus::Offline,
                    handle: WindowHandle {
                        conversation_id: conversation_id.clone(),
                        task: Some(task),
                    },
                }
            }
        }
    }

    /// The next page older than `before`.
    ///
    /// Returns fewer than `page_size` messages iff history is exhausted;
    /// once exhausted, repeated calls answer from the cache. Transient
    /// failures are retried, never returned.
    pub async fn load_older_page(
        &self,
        conversation_id: &ConversationId,
        before: ServerTime,
        page_size: usize,
    ) -> SyncResult<OlderPage> {
        let page_size = page_size.max(1);
        let known = {
            let state = lock(&self.state);
            if state.removed.contains(conversation_id) {
                return Err(SyncError::ConversationRemoved(conversation_id.clone()));
            }
            match state.windows.get(conversation_id) {
                Some(w) if w.is_exhausted() && w.floor().map_or(true, |f| before <= f) => {
                    return Ok(OlderPage {
                        messages: Vec::new(),
                        exhausted: true,
                    });
                }
                Some(w) => w.confirmed_at_or_before(before),
                None => 0,
            }
        };

        // Everything already cached at or before `before` comes back too,
        // so ask for that many more. Undecodable children widen the range
        // until a full page survives or the store runs out.
        let path = paths::messages(conversation_id);
        let mut limit = page_size + known;
        let (fetched, store_exhausted) = loop {
            let query = Query::order_by(ORDER_FIELD)
                .end_at(before.millis())
                .limit_to_last(limit);
            let snapshot = self.get_with_retry(&path, query).await?;
            let (raw, fetched) = decode_children(conversation_id, &snapshot);
            let store_exhausted = raw < limit;
            let fresh = self.count_uncached(conversation_id, &fetched);
            if store_exhausted || fresh >= page_size {
                break (fetched, store_exhausted);
            }
            debug!(
                conversation = %conversation_id,
                limit,
                skipped = raw - fetched.len(),
                "older page came up short, widening"
            );
            limit += page_size - fresh;
        };

        let page = {
            let mut state = lock(&self.state);
            if state.removed.contains(conversation_id) {
                return Err(SyncError::ConversationRemoved(conversation_id.clone()));
            }
            let window = state.windows.entry(conversation_id.clone()).or_default();
            let mut candidates: Vec<Message> =
                fetched.into_iter().filter(|m| !window.contains(m)).collect();
            if candidates.len() > page_size {
                candidates.drain(..candidates.len() - page_size);
            }
            let added = window.merge_older(candidates);
            if store_exhausted && added.len() < page_size {
                window.set_exhausted(true);
            }
            added
        };

        let exhausted = store_exhausted && page.len() < page_size;
        debug!(
            conversation = %conversation_id,
            before = before.millis(),
            count = page.len(),
            exhausted,
            "loaded older page"
        );
        if !page.is_empty() {
            self.persist(conversation_id, &page);
            self.events.emit(SyncEvent::WindowChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        Ok(OlderPage {
            messages: page,
            exhausted,
        })
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Current window contents, ascending.
    pub fn window(&self, conversation_id: &ConversationId) -> Vec<Message> {
        lock(&self.state)
            .windows
            .get(conversation_id)
            .map(MessageWindow::messages)
            .unwrap_or_default()
    }

    pub fn is_removed(&self, conversation_id: &ConversationId) -> bool {
        lock(&self.state).removed.contains(conversation_id)
    }

    pub fn has_confirmed(&self, conversation_id: &ConversationId, key: &str) -> bool {
        lock(&self.state)
            .windows
            .get(conversation_id)
            .is_some_and(|w| w.contains_confirmed(key))
    }

    /// Confirmed messages currently loaded.
    pub fn loaded_confirmed(&self, conversation_id: &ConversationId) -> Vec<Message> {
        lock(&self.state)
            .windows
            .get(conversation_id)
            .map(|w| w.iter().filter(|m| m.is_confirmed()).cloned().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Outbox and receipt hooks
    // -----------------------------------------------------------------------

    pub(crate) fn insert_local(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        lock(&self.state)
            .windows
            .entry(conversation_id.clone())
            .or_default()
            .insert_local(message);
        self.events.emit(SyncEvent::WindowChanged { conversation_id });
    }

    pub(crate) fn confirm_local(
        &self,
        conversation_id: &ConversationId,
        temp_id: TempId,
        key: &str,
        server_time: ServerTime,
    ) {
        let confirmed = {
            let mut state = lock(&self.state);
            let Some(window) = state.windows.get_mut(conversation_id) else {
                return;
            };
            if !window.confirm(temp_id, key, server_time) {
                return;
            }
            window
                .get(&MessageId::Confirmed(key.to_string()))
                .cloned()
        };
        if let Some(message) = confirmed {
            self.persist(conversation_id, std::slice::from_ref(&message));
        }
        self.events.emit(SyncEvent::WindowChanged {
            conversation_id: conversation_id.clone(),
        });
    }

    pub(crate) fn remove_local(&self, conversation_id: &ConversationId, temp_id: TempId) {
        let removed = lock(&self.state)
            .windows
            .get_mut(conversation_id)
            .is_some_and(|w| w.remove_local(temp_id));
        if removed {
            self.events.emit(SyncEvent::WindowChanged {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    /// Record `viewer` as having read `keys` at `at`.
    pub(crate) fn apply_read(
        &self,
        conversation_id: &ConversationId,
        viewer: &UserId,
        keys: &[String],
        at: ServerTime,
    ) {
        let updated: Vec<Message> = {
            let mut state = lock(&self.state);
            let Some(window) = state.windows.get_mut(conversation_id) else {
                return;
            };
            for key in keys {
                window.update_confirmed(key, |m| {
                    m.read_by.entry(viewer.clone()).or_insert(at);
                });
            }
            window
                .iter()
                .filter(|m| m.id.as_confirmed().is_some_and(|k| keys.iter().any(|x| x == k)))
                .cloned()
                .collect()
        };
        if !updated.is_empty() {
            self.persist(conversation_id, &updated);
            self.events.emit(SyncEvent::WindowChanged {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn fetch_latest(
        &self,
        conversation_id: &ConversationId,
        page_size: usize,
    ) -> SyncResult<Fetched> {
        let conversation = self
            .remote
            .get(&paths::conversation(conversation_id), Query::default())
            .await?;
        if !conversation.exists() {
            return Ok(Fetched::Removed);
        }
        let snapshot = self
            .remote
            .get(
                &paths::messages(conversation_id),
                Query::order_by(ORDER_FIELD).limit_to_last(page_size),
            )
            .await?;
        Ok(Fetched::Page(decode_children(conversation_id, &snapshot).1))
    }

    async fn get_with_retry(&self, path: &str, query: Query) -> SyncResult<Snapshot> {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            match self.remote.get(path, query.clone()).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_retryable() => {
                    debug!(path, error = %e, attempt = backoff.attempt(), "read failed, retrying");
                    if !*self.remote.connection_state().borrow() {
                        if !wait_connected(self.remote.as_ref()).await {
                            return Err(e);
                        }
                    } else {
                        backoff.wait().await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Keep fetching until the store answers. `false` if the conversation
    /// turned out to be gone.
    async fn recover(&self, conversation_id: &ConversationId, page_size: usize) -> bool {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            if !wait_connected(self.remote.as_ref()).await {
                return false;
            }
            match self.fetch_latest(conversation_id, page_size).await {
                Ok(Fetched::Removed) => {
                    self.mark_removed(conversation_id);
                    return false;
                }
                Ok(Fetched::Page(page)) => {
                    info!(conversation = %conversation_id, attempts = backoff.attempt() + 1, "window recovered");
                    self.install_page(conversation_id, page);
                    return true;
                }
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "window reload failed");
                    backoff.wait().await;
                }
            }
        }
    }

    /// Consume the live feed for one conversation until the handle drops or
    /// the conversation disappears.
    async fn run_live(self: Arc<Self>, conversation_id: ConversationId) {
        let mut backoff = Backoff::from_config(&self.config);
        loop {
            let query = match self.floor(&conversation_id) {
                Some(floor) => Query::order_by(ORDER_FIELD).start_at(floor.millis()),
                None => Query::order_by(ORDER_FIELD),
            };
            let conversation_path = paths::conversation(&conversation_id);
            let messages_path = paths::messages(&conversation_id);
            let subscribed = tokio::try_join!(
                self.remote.subscribe(&conversation_path, Query::default()),
                self.remote.subscribe(&messages_path, query),
            );
            let (mut conversation, mut messages) = match subscribed {
                Ok(subs) => subs,
                Err(e) => {
                    warn!(conversation = %conversation_id, error = %e, "subscribe failed, retrying");
                    backoff.wait().await;
                    continue;
                }
            };
            backoff.reset();
            debug!(conversation = %conversation_id, "live feed started");

            loop {
                tokio::select! {
                    Some(snapshot) = conversation.next() => {
                        if !snapshot.exists() {
                            self.mark_removed(&conversation_id);
                            return;
                        }
                    }
                    Some(snapshot) = messages.next() => self.apply_live(&conversation_id, &snapshot),
                    else => break,
                }
            }
            warn!(conversation = %conversation_id, "live feed ended, resubscribing");
            backoff.wait().await;
        }
    }

    fn apply_live(&self, conversation_id: &ConversationId, snapshot: &Snapshot) {
        let (_, incoming) = decode_children(conversation_id, snapshot);
        let changed = {
            let mut state = lock(&self.state);
            if state.removed.contains(conversation_id) {
                return;
            }
            state
                .windows
                .entry(conversation_id.clone())
                .or_default()
                .merge_live(incoming.clone())
        };
        if changed {
            debug!(conversation = %conversation_id, count = incoming.len(), "merged live snapshot");
            self.persist(conversation_id, &incoming);
            self.events.emit(SyncEvent::WindowChanged {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    fn install_page(&self, conversation_id: &ConversationId, page: Vec<Message>) -> Vec<Message> {
        let messages = {
            let mut state = lock(&self.state);
            state.removed.remove(conversation_id);
            let window = state.windows.entry(conversation_id.clone()).or_default();
            window.reset_confirmed();
            window.merge_live(page.clone());
            window.messages()
        };
        self.persist(conversation_id, &page);
        self.events.emit(SyncEvent::WindowChanged {
            conversation_id: conversation_id.clone(),
        });
        messages
    }

    fn install_local(&self, conversation_id: &ConversationId, page_size: usize) -> Vec<Message> {
        let cached = match &self.local {
            None => Vec::new(),
            Some(local) => {
                let db = lock(local);
                match db.cached_window(conversation_id, page_size) {
                    Ok(messages) => messages,
                    Err(StoreError::Corrupt(_)) => {
                        warn!(conversation = %conversation_id, "local window corrupt, discarding");
                        if let Err(e) = db.discard_window(conversation_id) {
                            warn!(conversation = %conversation_id, error = %e, "failed to discard local window");
                        }
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(conversation = %conversation_id, error = %e, "failed to read local window");
                        Vec::new()
                    }
                }
            }
        };
        let mut state = lock(&self.state);
        let window = state.windows.entry(conversation_id.clone()).or_default();
        window.merge_live(cached);
        window.messages()
    }

    fn mark_removed(&self, conversation_id: &ConversationId) {
        {
            let mut state = lock(&self.state);
            state.windows.remove(conversation_id);
            state.removed.insert(conversation_id.clone());
        }
        if let Some(local) = &self.local {
            if let Err(e) = lock(local).discard_window(conversation_id) {
                warn!(conversation = %conversation_id, error = %e, "failed to discard local window");
            }
        }
        info!(conversation = %conversation_id, "conversation removed");
        self.events.emit(SyncEvent::ConversationRemoved {
            conversation_id: conversation_id.clone(),
        });
    }

    fn count_uncached(&self, conversation_id: &ConversationId, messages: &[Message]) -> usize {
        let state = lock(&self.state);
        match state.windows.get(conversation_id) {
            Some(window) => messages.iter().filter(|m| !window.contains(m)).count(),
            None => messages.len(),
        }
    }

    fn floor(&self, conversation_id: &ConversationId) -> Option<ServerTime> {
        lock(&self.state)
            .windows
            .get(conversation_id)
            .and_then(MessageWindow::floor)
    }

    fn persist(&self, conversation_id: &ConversationId, messages: &[Message]) {
        let Some(local) = &self.local else {
            return;
        };
        if let Err(e) = lock(local).upsert_cached_messages(conversation_id, messages) {
            warn!(conversation = %conversation_id, error = %e, "failed to persist window");
        }
    }
}

/// Decode the children of a messages snapshot in server order. Returns the
/// raw child count alongside the decodable messages.
fn decode_children(conversation_id: &ConversationId, snapshot: &Snapshot) -> (usize, Vec<Message>) {
    let children = snapshot.children_ordered_by(ORDER_FIELD);
    let raw = children.len();
    let messages = children
        .into_iter()
        .filter_map(
            |(key, value)| match record::decode_message(conversation_id, &key, &value) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(conversation = %conversation_id, key = %key, error = %e, "skipping undecodable message");
                    None
                }
            },
        )
        .collect();
    (raw, messages)
}
