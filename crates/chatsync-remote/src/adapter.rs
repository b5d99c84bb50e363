//! The seam between the sync engine and the hosted, push-based store.
//!
//! The engine only ever talks to a [`RemoteStore`]. Production wires in the
//! hosted store's client runtime; tests use `MemoryRemote`, built with the
//! `testing` feature.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use chatsync_shared::{ServerTime, SyncResult};

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Child ordering / range filter applied to the value at a path.
///
/// With no `order_by` the whole value is returned. Otherwise the children
/// of the value are ordered by the integer field `order_by` (ties by key),
/// restricted to `start_at..=end_at`, and truncated to the last
/// `limit_to_last` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub order_by: Option<String>,
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
    pub limit_to_last: Option<usize>,
}

impl Query {
    pub fn order_by(field: impl Into<String>) -> Self {
        Self {
            order_by: Some(field.into()),
            ..Self::default()
        }
    }

    pub fn start_at(mut self, v: i64) -> Self {
        self.start_at = Some(v);
        self
    }

    pub fn end_at(mut self, v: i64) -> Self {
        self.end_at = Some(v);
        self
    }

    pub fn limit_to_last(mut self, n: usize) -> Self {
        self.limit_to_last = Some(n);
        self
    }
}

// ---------------------------------------------------------------------------
// Snapshot / ack
// ---------------------------------------------------------------------------

/// The value at a path at one point in time. `None` means nothing is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: String,
    pub value: Option<Value>,
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        self.value.as_ref().is_some_and(|v| !v.is_null())
    }

    /// Children as `(key, value)` pairs ordered by the integer field
    /// `order_by`, then by key.
    pub fn children_ordered_by(&self, order_by: &str) -> Vec<(String, Value)> {
        let Some(Value::Object(map)) = &self.value else {
            return Vec::new();
        };
        let mut children: Vec<(String, Value)> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        children.sort_by(|(ka, va), (kb, vb)| {
            sort_key(va, order_by)
                .cmp(&sort_key(vb, order_by))
                .then_with(|| ka.cmp(kb))
        });
        children
    }
}

/// Integer ordering key of a child; children without it sort first.
pub fn sort_key(child: &Value, order_by: &str) -> i64 {
    child.get(order_by).and_then(Value::as_i64).unwrap_or(i64::MIN)
}

/// Acknowledgement of a write, carrying the server time used to resolve
/// its timestamp placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub server_time: ServerTime,
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// A live feed of snapshots. The first snapshot is the current value, every
/// later one follows a change. Dropping the handle unsubscribes.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        path: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Snapshot>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next snapshot. `None` once the store side has gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Explicitly close the subscription.
    pub fn close(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Push-based hierarchical store with server-resolved timestamps and
/// store-side disconnect hooks.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to the (queried) value at `path`.
    async fn subscribe(&self, path: &str, query: Query) -> SyncResult<Subscription>;

    /// One-shot read.
    async fn get(&self, path: &str, query: Query) -> SyncResult<Snapshot>;

    /// Replace the value at `path`. `Value::Null` removes it.
    async fn write(&self, path: &str, value: Value) -> SyncResult<WriteAck>;

    /// Multi-path update applied as one unit with a single server time.
    async fn patch(&self, updates: BTreeMap<String, Value>) -> SyncResult<WriteAck>;

    /// Set `path` to `next` only if it currently holds `expected`.
    /// Fails with `ConflictingWrite` otherwise.
    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Value>,
        next: Option<Value>,
    ) -> SyncResult<WriteAck>;

    /// A fresh, store-assigned child key under `path`. Nothing is written.
    async fn reserve_key(&self, path: &str) -> SyncResult<String>;

    /// Ask the store to write `value` at `path` when it loses this client,
    /// whether or not the client shuts down cleanly.
    async fn register_on_disconnect(&self, path: &str, value: Value) -> SyncResult<()>;

    async fn cancel_on_disconnect(&self, path: &str) -> SyncResult<()>;

    /// `true` while connected. The current value is available immediately.
    fn connection_state(&self) -> watch::Receiver<bool>;

    /// Best estimate of the store's clock.
    fn server_now(&self) -> ServerTime;

    /// Store clock minus local clock, in milliseconds.
    fn server_time_offset(&self) -> i64 {
        self.server_now().millis() - ServerTime::local_now().millis()
    }
}

pub use chatsync_shared::record::{increment, server_timestamp as server_timestamp_placeholder};
