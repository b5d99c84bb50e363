//! Who the engine acts as.

use tokio::sync::watch;

use chatsync_shared::{SyncError, SyncResult, UserId};

/// Source of the authenticated user's id.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    /// Follows sign-in / sign-out. The current value is available
    /// immediately.
    fn on_auth_change(&self) -> watch::Receiver<Option<UserId>>;

    fn require_user(&self) -> SyncResult<UserId> {
        self.current_user_id().ok_or(SyncError::NotAuthenticated)
    }
}

/// Identity set by the host application.
#[derive(Debug)]
pub struct StaticIdentity {
    tx: watch::Sender<Option<UserId>>,
}

impl StaticIdentity {
    pub fn new(user: impl Into<UserId>) -> Self {
        let (tx, _) = watch::channel(Some(user.into()));
        Self { tx }
    }

    pub fn signed_out() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn sign_in(&self, user: impl Into<UserId>) {
        self.tx.send_replace(Some(user.into()));
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(None);
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        self.tx.borrow().clone()
    }

    fn on_auth_change(&self) -> watch::Receiver<Option<UserId>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_out_is_observed() {
        let identity = StaticIdentity::new("alice");
        let mut rx = identity.on_auth_change();
        assert_eq!(identity.require_user().unwrap(), UserId::from("alice"));

        identity.sign_out();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), None);
        assert_eq!(identity.require_user(), Err(SyncError::NotAuthenticated));
    }
}
