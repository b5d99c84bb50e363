//! The engine façade: wires every component to one remote store, one
//! identity and one local database.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use chatsync_shared::{
    Conversation, ConversationId, Draft, Message, OutboxEntry, OutboxState, PresenceRecord, Role,
    ServerTime, SyncResult, TempId, UserId,
};
use chatsync_store::Database;

use crate::actions::MessageActions;
use crate::cache::{MessageCache, OlderPage, WindowLoad};
use crate::config::ClientConfig;
use crate::directory::ConversationDirectory;
use crate::events::{EventBus, SyncEvent};
use crate::guard::BlockGuard;
use crate::identity::IdentityProvider;
use crate::outbox::Outbox;
use crate::presence::{PresenceTracker, PresenceWatch};
use crate::receipts::{ReadTracker, UnreadWatch};
use crate::typing::{TypingTracker, TypingWatch};
use crate::{LocalStore, SharedRemote};

/// Central engine state.
///
/// Every component shares the same remote handle, identity, event bus
/// and local database.
pub struct SyncEngine {
    config: ClientConfig,

    identity: Arc<dyn IdentityProvider>,

    /// Broadcast of every [`SyncEvent`] the components emit.
    events: EventBus,

    /// Handle to the SQLite database holding the outbox and cached windows.
    local: LocalStore,

    directory: Arc<ConversationDirectory>,
    guard: Arc<BlockGuard>,
    cache: Arc<MessageCache>,
    outbox: Arc<Outbox>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingTracker>,
    receipts: Arc<ReadTracker>,
    actions: MessageActions,

    /// Background tasks owned by the engine, aborted on drop.
    tasks: Vec<JoinHandle<()>>,
}

impl SyncEngine {
    /// Open the local database, restore the outbox and announce presence
    /// if a user is signed in.
    pub async fn start(
        remote: SharedRemote,
        identity: Arc<dyn IdentityProvider>,
        config: ClientConfig,
    ) -> SyncResult<Self> {
        let database = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::open_in_memory()?,
        };
        let local: LocalStore = Arc::new(Mutex::new(database));
        let events = EventBus::new(config.event_capacity);

        let directory = Arc::new(ConversationDirectory::new(remote.clone(), &config));
        let guard = Arc::new(BlockGuard::new(remote.clone(), directory.clone()));
        let cache = MessageCache::new(
            remote.clone(),
            Some(local.clone()),
            events.clone(),
            config.clone(),
        );
        let outbox = Outbox::new(
            remote.clone(),
            identity.clone(),
            guard.clone(),
            directory.clone(),
            cache.clone(),
            Some(local.clone()),
            events.clone(),
            config.clone(),
        );
        let presence = PresenceTracker::new(
            remote.clone(),
            identity.clone(),
            guard.clone(),
            events.clone(),
            config.clone(),
        );
        let typing = TypingTracker::new(remote.clone(), identity.clone(), events.clone(), config.clone());
        let receipts = ReadTracker::new(
            remote.clone(),
            identity.clone(),
            cache.clone(),
            events.clone(),
            config.clone(),
        );
        let actions = MessageActions::new(remote.clone(), identity.clone(), &config);

        let restored = outbox.restore()?;
        let mut tasks = vec![presence.start()];
        tasks.push(spawn_auth_watch(identity.clone(), presence.clone()));

        info!(
            user = ?identity.current_user_id(),
            restored,
            persistent = config.db_path.is_some(),
            "sync engine started"
        );

        Ok(Self {
            config,
            identity,
            events,
            local,
            directory,
            guard,
            cache,
            outbox,
            presence,
            typing,
            receipts,
            actions,
            tasks,
        })
    }

    /// Announce the user offline and stop background work. Queued outbox
    /// entries stay persisted for the next start.
    pub async fn shutdown(self) {
        if self.identity.current_user_id().is_some() {
            if let Err(e) = self.presence.go_offline().await {
                warn!(error = %e, "failed to announce offline on shutdown");
            }
        }
        info!("sync engine stopped");
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn directory(&self) -> &Arc<ConversationDirectory> {
        &self.directory
    }

    pub fn guard(&self) -> &Arc<BlockGuard> {
        &self.guard
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn typing(&self) -> &Arc<TypingTracker> {
        &self.typing
    }

    pub fn receipts(&self) -> &Arc<ReadTracker> {
        &self.receipts
    }

    pub fn actions(&self) -> &MessageActions {
        &self.actions
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    pub async fn create_direct(&self, with: &UserId) -> SyncResult<Conversation> {
        let me = self.identity.require_user()?;
        self.directory.create_direct(&me, with).await
    }

    pub async fn create_group(&self, name: &str, members: &[UserId]) -> SyncResult<Conversation> {
        let me = self.identity.require_user()?;
        self.directory.create_group(name, &me, members).await
    }

    pub async fn set_member_role(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> SyncResult<()> {
        let me = self.identity.require_user()?;
        self.directory
            .set_member_role(&me, conversation_id, user, role)
            .await
    }

    pub async fn remove_member(&self, conversation_id: &ConversationId, user: &UserId) -> SyncResult<()> {
        let me = self.identity.require_user()?;
        self.directory.remove_member(&me, conversation_id, user).await
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Load the newest page with the configured page size.
    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> WindowLoad {
        self.cache
            .load_initial_window(conversation_id, self.config.page_size)
            .await
    }

    pub async fn load_older_page(
        &self,
        conversation_id: &ConversationId,
        before: ServerTime,
    ) -> SyncResult<OlderPage> {
        self.cache
            .load_older_page(conversation_id, before, self.config.page_size)
            .await
    }

    pub fn window(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.cache.window(conversation_id)
    }

    pub async fn send(&self, conversation_id: &ConversationId, draft: Draft) -> SyncResult<TempId> {
        self.outbox.enqueue(conversation_id, draft).await
    }

    pub fn retry(&self, temp_id: TempId) -> SyncResult<()> {
        self.outbox.retry(temp_id)
    }

    pub fn discard(&self, temp_id: TempId) -> SyncResult<()> {
        self.outbox.discard(temp_id)
    }

    pub fn outbox_state(&self, temp_id: TempId) -> Option<OutboxState> {
        self.outbox.state(temp_id)
    }

    pub fn pending(&self, conversation_id: &ConversationId) -> Vec<OutboxEntry> {
        self.outbox.pending(conversation_id)
    }

    pub async fn mark_read(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        self.receipts.mark_read(conversation_id).await
    }

    pub fn watch_unread(&self) -> SyncResult<UnreadWatch> {
        self.receipts.watch_unread()
    }

    // -----------------------------------------------------------------------
    // Presence, typing and blocks
    // -----------------------------------------------------------------------

    pub async fn can_send(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        let me = self.identity.require_user()?;
        self.guard.can_send(&me, conversation_id).await
    }

    pub async fn block(&self, user: &UserId) -> SyncResult<()> {
        let me = self.identity.require_user()?;
        self.guard.block(&me, user).await
    }

    pub async fn unblock(&self, user: &UserId) -> SyncResult<()> {
        let me = self.identity.require_user()?;
        self.guard.unblock(&me, user).await
    }

    pub fn watch_presence(&self, user: &UserId) -> PresenceWatch {
        self.presence.watch_presence(user)
    }

    pub async fn presence_of(&self, user: &UserId) -> SyncResult<Option<PresenceRecord>> {
        self.presence.presence_of(user).await
    }

    pub async fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) -> SyncResult<()> {
        self.typing.set_typing(conversation_id, is_typing).await
    }

    pub fn watch_typing(&self, conversation_id: &ConversationId) -> TypingWatch {
        self.typing.watch(conversation_id)
    }

    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.typing.typing_users(conversation_id)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Go online on every sign-in, starting with the current user if any.
fn spawn_auth_watch(
    identity: Arc<dyn IdentityProvider>,
    presence: Arc<PresenceTracker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = identity.on_auth_change();
        loop {
            let user = rx.borrow_and_update().clone();
            match user {
                Some(user) => {
                    info!(user = %user, "signed in");
                    if let Err(e) = presence.go_online().await {
                        warn!(error = %e, "failed to go online");
                    }
                }
                None => info!("signed out"),
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}
