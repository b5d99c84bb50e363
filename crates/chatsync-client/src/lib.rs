//! Client-side chat synchronization engine.
//!
//! [`SyncEngine`] keeps a local view of conversations, message windows,
//! presence and typing consistent with a push-based hosted store reached
//! through a [`chatsync_remote::RemoteStore`].

pub mod actions;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod directory;
pub mod engine;
pub mod events;
pub mod guard;
pub mod identity;
pub mod outbox;
pub mod presence;
pub mod receipts;
pub mod typing;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::{fmt, EnvFilter};

use chatsync_remote::RemoteStore;

pub use cache::{MessageCache, OlderPage, WindowHandle, WindowLoad, WindowStatus};
pub use config::ClientConfig;
pub use engine::SyncEngine;
pub use events::{EventBus, SyncEvent};
pub use identity::{IdentityProvider, StaticIdentity};

/// The remote store as shared by every component of the engine.
pub type SharedRemote = Arc<dyn RemoteStore>;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("chatsync_client=debug,chatsync_remote=info,chatsync_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Local persistence shared between components.
pub type LocalStore = Arc<Mutex<chatsync_store::Database>>;

/// Wait until the store reports a connection. `false` if the store side
/// is gone for good.
pub(crate) async fn wait_connected(remote: &dyn RemoteStore) -> bool {
    let mut rx = remote.connection_state();
    let connected = rx.wait_for(|connected| *connected).await.is_ok();
    connected
}
