//! Online / offline state of the local user and of watched users.
//!
//! Going online always registers a store-side hook that flips the record
//! back to offline when the store loses this client, so an unclean exit
//! still ends with `online: false` and a fresh `lastSeen`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatsync_remote::Query;
use chatsync_shared::record::{decode_presence, presence_value};
use chatsync_shared::{paths, PresenceRecord, SyncResult, UserId};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::events::{EventBus, SyncEvent};
use crate::guard::BlockGuard;
use crate::identity::IdentityProvider;
use crate::{lock, SharedRemote};

#[derive(Default)]
struct PresenceState {
    /// The user asked to be online; re-announced after every reconnect.
    wants_online: bool,
    online: bool,
    watched: HashMap<UserId, PresenceRecord>,
}

pub struct PresenceTracker {
    remote: SharedRemote,
    identity: Arc<dyn IdentityProvider>,
    guard: Arc<BlockGuard>,
    events: EventBus,
    config: ClientConfig,
    state: Mutex<PresenceState>,
}

/// Keeps a user's presence record flowing into the tracker.
#[derive(Debug)]
pub struct PresenceWatch {
    user_id: UserId,
    task: JoinHandle<()>,
}

impl PresenceWatch {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl Drop for PresenceWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl PresenceTracker {
    pub fn new(
        remote: SharedRemote,
        identity: Arc<dyn IdentityProvider>,
        guard: Arc<BlockGuard>,
        events: EventBus,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            identity,
            guard,
            events,
            config,
            state: Mutex::new(PresenceState::default()),
        })
    }

    /// Whether the local user is currently announced as online.
    pub fn is_online(&self) -> bool {
        lock(&self.state).online
    }

    pub async fn go_online(&self) -> SyncResult<()> {
        let user = self.identity.require_user()?;
        lock(&self.state).wants_online = true;
        self.announce(&user).await
    }

    pub async fn go_offline(&self) -> SyncResult<()> {
        let user = self.identity.require_user()?;
        {
            let mut state = lock(&self.state);
            state.wants_online = false;
            state.online = false;
        }
        let path = paths::presence(&user);
        self.remote.write(&path, presence_value(false)).await?;
        self.remote.cancel_on_disconnect(&path).await?;
        info!(user = %user, "presence offline");
        Ok(())
    }

    async fn announce(&self, user: &UserId) -> SyncResult<()> {
        let path = paths::presence(user);
        self.remote
            .register_on_disconnect(&path, presence_value(false))
            .await?;
        self.remote.write(&path, presence_value(true)).await?;
        lock(&self.state).online = true;
        info!(user = %user, "presence online");
        Ok(())
    }

    /// Follow the connection: re-announce after every reconnect while the
    /// user wants to be online.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut rx = tracker.remote.connection_state();
            rx.borrow_and_update();
            // A drop and return can coalesce into a single change.
            while rx.changed().await.is_ok() {
                let connected = *rx.borrow_and_update();
                tracker.events.emit(SyncEvent::ConnectionChanged { connected });
                if !connected {
                    debug!("connection lost, presence handled by the store");
                    lock(&tracker.state).online = false;
                    continue;
                }
                let wants_online = lock(&tracker.state).wants_online;
                let Some(user) = tracker.identity.current_user_id() else {
                    continue;
                };
                if wants_online {
                    if let Err(e) = tracker.announce(&user).await {
                        warn!(error = %e, "failed to re-announce presence");
                    }
                }
            }
        })
    }

    /// Keep `user`'s presence record up to date until the watch drops.
    pub fn watch_presence(self: &Arc<Self>, user: &UserId) -> PresenceWatch {
        let tracker = self.clone();
        let user_id = user.clone();
        let task = tokio::spawn(async move {
            let mut backoff = Backoff::from_config(&tracker.config);
            loop {
                let mut sub = match tracker
                    .remote
                    .subscribe(&paths::presence(&user_id), Query::default())
                    .await
                {
                    Ok(sub) => sub,
                    Err(e) => {
                        warn!(user = %user_id, error = %e, "presence subscribe failed");
                        backoff.wait().await;
                        continue;
                    }
                };
                backoff.reset();
                while let Some(snapshot) = sub.next().await {
                    let record = decode_presence(&user_id, snapshot.value.as_ref());
                    debug!(user = %user_id, online = record.online, "presence update");
                    lock(&tracker.state).watched.insert(user_id.clone(), record);
                    tracker.events.emit(SyncEvent::PresenceChanged {
                        user_id: user_id.clone(),
                    });
                }
                backoff.wait().await;
            }
        });
        PresenceWatch {
            user_id: user.clone(),
            task,
        }
    }

    /// `user`'s presence as the local user may see it: `None` when a block
    /// relation exists in either direction.
    pub async fn presence_of(&self, user: &UserId) -> SyncResult<Option<PresenceRecord>> {
        let viewer = self.identity.require_user()?;
        if !self.guard.is_visible(user, &viewer).await? {
            return Ok(None);
        }
        let watched = lock(&self.state).watched.get(user).cloned();
        if let Some(record) = watched {
            return Ok(Some(record));
        }
        let snapshot = self
            .remote
            .get(&paths::presence(user), Query::default())
            .await?;
        Ok(Some(decode_presence(user, snapshot.value.as_ref())))
    }
}
