use serde_json::Value;
use tracing::debug;

use chatsync_shared::{SyncError, SyncResult};

use crate::adapter::{Query, RemoteStore, WriteAck};

/// Outcome of a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    /// The value the update function produced (placeholders unresolved).
    pub value: Option<Value>,
    pub ack: WriteAck,
    pub attempts: u32,
}

/// Optimistic read-modify-write of the value at `path`.
///
/// `update` receives the current value and returns the next one (`None`
/// deletes) or an error that aborts the transaction. A lost
/// compare-and-set re-reads and re-runs `update`, up to `max_attempts`
/// times, after which the transaction fails with `WriteFailed`.
pub async fn transact<S, F>(
    store: &S,
    path: &str,
    max_attempts: u32,
    mut update: F,
) -> SyncResult<Committed>
where
    S: RemoteStore + ?Sized,
    F: FnMut(Option<&Value>) -> SyncResult<Option<Value>> + Send,
{
    for attempt in 1..=max_attempts.max(1) {
        let current = store.get(path, Query::default()).await?.value;
        let next = update(current.as_ref())?;

        match store.compare_and_set(path, current, next.clone()).await {
            Ok(ack) => {
                return Ok(Committed {
                    value: next,
                    ack,
                    attempts: attempt,
                })
            }
            Err(SyncError::ConflictingWrite(_)) => {
                debug!(path, attempt, "transaction lost compare-and-set, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(SyncError::WriteFailed {
        path: path.to_string(),
        attempts: max_attempts.max(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use serde_json::json;

    fn bump(current: Option<&Value>) -> SyncResult<Option<Value>> {
        let n = current.and_then(Value::as_i64).unwrap_or(0);
        Ok(Some(json!(n + 1)))
    }

    #[tokio::test]
    async fn retries_through_contention() {
        let backend = MemoryBackend::spawn();
        let remote = backend.connect("alice").await;
        remote.contend_next_cas(2).await;

        let committed = transact(&remote, "counter", 5, bump).await.unwrap();
        assert_eq!(committed.attempts, 3);
        assert_eq!(backend.read("counter").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn gives_up_with_write_failed() {
        let backend = MemoryBackend::spawn();
        let remote = backend.connect("alice").await;
        remote.contend_next_cas(10).await;

        let err = transact(&remote, "counter", 3, bump).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::WriteFailed {
                path: "counter".into(),
                attempts: 3
            }
        );
        assert_eq!(backend.read("counter").await, None);
    }

    #[tokio::test]
    async fn update_error_aborts() {
        let backend = MemoryBackend::spawn();
        let remote = backend.connect("alice").await;
        let err = transact(&remote, "x", 3, |_| Err(SyncError::NotPermitted("no".into())))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::NotPermitted("no".into()));
    }
}
