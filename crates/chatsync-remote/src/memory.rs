//! In-process simulation of the hosted store.
//!
//! The [`MemoryBackend`] runs in a dedicated tokio task that owns the JSON
//! tree. Each [`MemoryRemote`] is one client connection to it: requests and
//! subscriptions travel over a command channel and are answered through
//! oneshot replies, so every client sees the store the way it would see the
//! real hosted one: asynchronously, and only while connected.
//!
//! Each client also carries fault switches (injected transient failures,
//! stalled acknowledgements, compare-and-set contention, crash) so the engine
//! can be exercised against the failure modes it has to survive.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use chatsync_shared::paths::overlaps;
use chatsync_shared::{ServerTime, SyncError, SyncResult};

use crate::adapter::{Query, RemoteStore, Snapshot, Subscription, WriteAck};
use crate::clock::ServerClock;
use crate::tree;

type ClientId = u64;
type ReplyTx = oneshot::Sender<SyncResult<Reply>>;

/// One entry of the backend's write log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedWrite {
    /// Label of the client that issued the write (`"<label>:on-disconnect"`
    /// for hook writes, `"admin"` for seeding).
    pub client: String,
    pub paths: Vec<String>,
    pub at: ServerTime,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Op {
    Get {
        path: String,
        query: Query,
    },
    Write {
        path: String,
        value: Value,
    },
    Patch(BTreeMap<String, Value>),
    Cas {
        path: String,
        expected: Option<Value>,
        next: Option<Value>,
    },
    ReserveKey,
    OnDisconnect {
        path: String,
        value: Value,
    },
    CancelOnDisconnect {
        path: String,
    },
}

impl Op {
    fn is_write(&self) -> bool {
        matches!(self, Op::Write { .. } | Op::Patch(_) | Op::Cas { .. })
    }
}

#[derive(Debug)]
enum Reply {
    Snapshot(Snapshot),
    Ack(WriteAck),
    Key(String),
    Done,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    FailNext(u32),
    Stall(bool),
    Contention(u32),
}

enum BackendCommand {
    Connect {
        client: ClientId,
        label: String,
        state_tx: watch::Sender<bool>,
    },
    Request {
        client: ClientId,
        op: Op,
        reply: ReplyTx,
    },
    Subscribe {
        client: ClientId,
        sub_id: u64,
        path: String,
        query: Query,
        tx: mpsc::UnboundedSender<Snapshot>,
    },
    Unsubscribe {
        sub_id: u64,
    },
    SetConnected {
        client: ClientId,
        connected: bool,
        drop_subscriptions: bool,
        done: oneshot::Sender<()>,
    },
    Fault {
        client: ClientId,
        fault: Fault,
        done: oneshot::Sender<()>,
    },
    AdminRead {
        path: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    AdminWrite {
        path: String,
        value: Value,
        done: oneshot::Sender<()>,
    },
    WriteLog {
        reply: oneshot::Sender<Vec<LoggedWrite>>,
    },
}

// ---------------------------------------------------------------------------
// Backend task state
// ---------------------------------------------------------------------------

struct ClientState {
    label: String,
    connected: bool,
    state_tx: watch::Sender<bool>,
    on_disconnect: Vec<(String, Value)>,
    fail_next: u32,
    stalled: bool,
    contention: u32,
    held: VecDeque<(Op, ReplyTx)>,
}

struct Sub {
    client: ClientId,
    path: String,
    query: Query,
    tx: mpsc::UnboundedSender<Snapshot>,
    /// Last value delivered; `None` until the first delivery.
    last: Option<Option<Value>>,
}

struct Backend {
    root: Value,
    clients: HashMap<ClientId, ClientState>,
    subs: HashMap<u64, Sub>,
    log: Vec<LoggedWrite>,
    clock: Arc<ServerClock>,
    key_seq: u64,
}

impl Backend {
    fn handle(&mut self, cmd: BackendCommand) {
        match cmd {
            BackendCommand::Connect {
                client,
                label,
                state_tx,
            } => {
                info!(client = %label, "client connected to memory backend");
                self.clients.insert(
                    client,
                    ClientState {
                        label,
                        connected: true,
                        state_tx,
                        on_disconnect: Vec::new(),
                        fail_next: 0,
                        stalled: false,
                        contention: 0,
                        held: VecDeque::new(),
                    },
                );
            }
            BackendCommand::Request { client, op, reply } => self.request(client, op, reply),
            BackendCommand::Subscribe {
                client,
                sub_id,
                path,
                query,
                tx,
            } => {
                let connected = self.clients.get(&client).is_some_and(|c| c.connected);
                let mut sub = Sub {
                    client,
                    path,
                    query,
                    tx,
                    last: None,
                };
                if connected {
                    deliver(&self.root, &mut sub);
                }
                self.subs.insert(sub_id, sub);
            }
            BackendCommand::Unsubscribe { sub_id } => {
                if let Some(sub) = self.subs.remove(&sub_id) {
                    debug!(sub_id, path = %sub.path, "unsubscribed");
                }
            }
            BackendCommand::SetConnected {
                client,
                connected,
                drop_subscriptions,
                done,
            } => {
                self.set_connected(client, connected, drop_subscriptions);
                let _ = done.send(());
            }
            BackendCommand::Fault {
                client,
                fault,
                done,
            } => {
                self.apply_fault(client, fault);
                let _ = done.send(());
            }
            BackendCommand::AdminRead { path, reply } => {
                let _ = reply.send(tree::get(&self.root, &path).cloned());
            }
            BackendCommand::AdminWrite { path, value, done } => {
                self.commit("admin".to_string(), vec![(path, value)]);
                let _ = done.send(());
            }
            BackendCommand::WriteLog { reply } => {
                let _ = reply.send(self.log.clone());
            }
        }
    }

    fn request(&mut self, client: ClientId, op: Op, reply: ReplyTx) {
        let Some(state) = self.clients.get_mut(&client) else {
            let _ = reply.send(Err(SyncError::TransientNetwork("unknown client".into())));
            return;
        };
        if !state.connected {
            let _ = reply.send(Err(SyncError::TransientNetwork("offline".into())));
            return;
        }
        if op.is_write() {
            if state.fail_next > 0 {
                state.fail_next -= 1;
                debug!(client = %state.label, "injected transient failure");
                let _ = reply.send(Err(SyncError::TransientNetwork(
                    "injected failure".into(),
                )));
                return;
            }
            if state.stalled {
                debug!(client = %state.label, "holding write (stalled)");
                state.held.push_back((op, reply));
                return;
            }
        }
        let result = self.execute(client, op);
        let _ = reply.send(result);
    }

    fn execute(&mut self, client: ClientId, op: Op) -> SyncResult<Reply> {
        let label = self
            .clients
            .get(&client)
            .map(|c| c.label.clone())
            .unwrap_or_default();

        match op {
            Op::Get { path, query } => {
                let value = tree::apply_query(tree::get(&self.root, &path), &query);
                Ok(Reply::Snapshot(Snapshot { path, value }))
            }
            Op::Write { path, value } => Ok(Reply::Ack(self.commit(label, vec![(path, value)]))),
            Op::Patch(updates) => Ok(Reply::Ack(self.commit(label, updates.into_iter().collect()))),
            Op::Cas {
                path,
                expected,
                next,
            } => {
                if let Some(state) = self.clients.get_mut(&client) {
                    if state.contention > 0 {
                        state.contention -= 1;
                        return Err(SyncError::ConflictingWrite(path));
                    }
                }
                let current = tree::get(&self.root, &path).cloned();
                let expected = expected.filter(|v| !v.is_null());
                if current != expected {
                    return Err(SyncError::ConflictingWrite(path));
                }
                let next = next.unwrap_or(Value::Null);
                Ok(Reply::Ack(self.commit(label, vec![(path, next)])))
            }
            Op::ReserveKey => {
                self.key_seq += 1;
                let now = self.clock.now().millis().max(0);
                Ok(Reply::Key(format!("k{now:013}{:06}", self.key_seq)))
            }
            Op::OnDisconnect { path, value } => {
                if let Some(state) = self.clients.get_mut(&client) {
                    state.on_disconnect.retain(|(p, _)| p != &path);
                    state.on_disconnect.push((path, value));
                }
                Ok(Reply::Done)
            }
            Op::CancelOnDisconnect { path } => {
                if let Some(state) = self.clients.get_mut(&client) {
                    state.on_disconnect.retain(|(p, _)| p != &path);
                }
                Ok(Reply::Done)
            }
        }
    }

    /// Resolve placeholders against the pre-write tree, apply every update
    /// under one server time, log, and notify subscribers.
    fn commit(&mut self, label: String, updates: Vec<(String, Value)>) -> WriteAck {
        let now = self.clock.stamp();
        let resolved: Vec<(String, Value)> = updates
            .into_iter()
            .map(|(path, value)| {
                let v = tree::resolve(&self.root, &path, &value, now);
                (path, v)
            })
            .collect();
        for (path, value) in &resolved {
            tree::set(&mut self.root, path, Some(value.clone()));
        }
        let paths: Vec<String> = resolved.into_iter().map(|(p, _)| p).collect();
        debug!(client = %label, paths = ?paths, at = now.millis(), "committed write");
        self.notify(&paths);
        self.log.push(LoggedWrite {
            client: label,
            paths,
            at: now,
        });
        WriteAck { server_time: now }
    }

    fn notify(&mut self, paths: &[String]) {
        let root = &self.root;
        let clients = &self.clients;
        let mut closed = Vec::new();
        for (id, sub) in self.subs.iter_mut() {
            if !clients.get(&sub.client).is_some_and(|c| c.connected) {
                continue;
            }
            if paths.iter().any(|p| overlaps(p, &sub.path)) && !deliver(root, sub) {
                closed.push(*id);
            }
        }
        for id in closed {
            self.subs.remove(&id);
        }
    }

    fn set_connected(&mut self, client: ClientId, connected: bool, drop_subscriptions: bool) {
        if drop_subscriptions {
            self.subs.retain(|_, s| s.client != client);
        }
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        if state.connected == connected {
            return;
        }
        state.connected = connected;
        let _ = state.state_tx.send(connected);
        let label = state.label.clone();

        if connected {
            info!(client = %label, "client reconnected");
            let root = &self.root;
            for sub in self.subs.values_mut().filter(|s| s.client == client) {
                deliver(root, sub);
            }
        } else {
            let hooks = std::mem::take(&mut state.on_disconnect);
            warn!(client = %label, hooks = hooks.len(), "client lost, firing disconnect hooks");
            if !hooks.is_empty() {
                self.commit(format!("{label}:on-disconnect"), hooks);
            }
        }
    }

    fn apply_fault(&mut self, client: ClientId, fault: Fault) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        match fault {
            Fault::FailNext(n) => state.fail_next = n,
            Fault::Contention(n) => state.contention = n,
            Fault::Stall(true) => state.stalled = true,
            Fault::Stall(false) => {
                state.stalled = false;
                let held: Vec<(Op, ReplyTx)> = state.held.drain(..).collect();
                for (op, reply) in held {
                    let result = self.execute(client, op);
                    let _ = reply.send(result);
                }
            }
        }
    }
}

/// Send the current value to `sub` if it changed. Returns `false` once the
/// subscriber is gone.
fn deliver(root: &Value, sub: &mut Sub) -> bool {
    let value = tree::apply_query(tree::get(root, &sub.path), &sub.query);
    if sub.last.as_ref() == Some(&value) {
        return true;
    }
    sub.last = Some(value.clone());
    sub.tx
        .send(Snapshot {
            path: sub.path.clone(),
            value,
        })
        .is_ok()
}

// ---------------------------------------------------------------------------
// Public handles
// ---------------------------------------------------------------------------

/// Handle on the simulated hosted store. Spawn once, then `connect` one
/// [`MemoryRemote`] per simulated client.
pub struct MemoryBackend {
    cmd_tx: mpsc::Sender<BackendCommand>,
    clock: Arc<ServerClock>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBackend {
    /// Spawn the backend task with a clock that follows the local wall clock.
    pub fn spawn() -> Arc<Self> {
        Self::spawn_with_clock(ServerClock::system(0))
    }

    /// Spawn the backend task. Must be called inside a tokio runtime.
    pub fn spawn_with_clock(clock: ServerClock) -> Arc<Self> {
        let clock = Arc::new(clock);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<BackendCommand>(256);

        let mut backend = Backend {
            root: json!({}),
            clients: HashMap::new(),
            subs: HashMap::new(),
            log: Vec::new(),
            clock: clock.clone(),
            key_seq: 0,
        };

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                backend.handle(cmd);
            }
            debug!("memory backend stopped");
        });

        Arc::new(Self {
            cmd_tx,
            clock,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Open a new, connected client.
    pub async fn connect(&self, label: &str) -> MemoryRemote {
        let client = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(true);
        let _ = self
            .cmd_tx
            .send(BackendCommand::Connect {
                client,
                label: label.to_string(),
                state_tx,
            })
            .await;
        MemoryRemote {
            client,
            label: label.to_string(),
            cmd_tx: self.cmd_tx.clone(),
            conn_rx: state_rx,
            clock: self.clock.clone(),
            next_id: self.next_id.clone(),
        }
    }

    pub fn clock(&self) -> &ServerClock {
        &self.clock
    }

    /// Read the tree directly, bypassing any client connection.
    pub async fn read(&self, path: &str) -> Option<Value> {
        let (reply, rx) = oneshot::channel();
        let cmd = BackendCommand::AdminRead {
            path: path.to_string(),
            reply,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Write directly (placeholders are resolved), bypassing any client.
    pub async fn seed(&self, path: &str, value: Value) {
        let (done, rx) = oneshot::channel();
        let cmd = BackendCommand::AdminWrite {
            path: path.to_string(),
            value,
            done,
        };
        if self.cmd_tx.send(cmd).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn write_log(&self) -> Vec<LoggedWrite> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(BackendCommand::WriteLog { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// One client connection to a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryRemote {
    client: ClientId,
    label: String,
    cmd_tx: mpsc::Sender<BackendCommand>,
    conn_rx: watch::Receiver<bool>,
    clock: Arc<ServerClock>,
    next_id: Arc<AtomicU64>,
}

impl MemoryRemote {
    pub fn label(&self) -> &str {
        &self.label
    }

    async fn request(&self, op: Op) -> SyncResult<Reply> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(BackendCommand::Request {
                client: self.client,
                op,
                reply,
            })
            .await
            .map_err(|_| SyncError::TransientNetwork("store unavailable".into()))?;
        rx.await
            .map_err(|_| SyncError::TransientNetwork("store dropped request".into()))?
    }

    async fn control(&self, build: impl FnOnce(oneshot::Sender<()>) -> BackendCommand) {
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(build(done)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Simulate the network going down (`false`) or coming back (`true`).
    /// Going down fires this client's disconnect hooks store-side.
    pub async fn set_connected(&self, connected: bool) {
        let client = self.client;
        self.control(|done| BackendCommand::SetConnected {
            client,
            connected,
            drop_subscriptions: false,
            done,
        })
        .await;
    }

    /// Simulate the client process dying: no sign-out, subscriptions gone,
    /// the store notices the lost connection and fires the hooks.
    pub async fn crash(&self) {
        let client = self.client;
        self.control(|done| BackendCommand::SetConnected {
            client,
            connected: false,
            drop_subscriptions: true,
            done,
        })
        .await;
    }

    /// The next `n` writes fail with a transient error.
    pub async fn fail_next_writes(&self, n: u32) {
        self.fault(Fault::FailNext(n)).await;
    }

    /// While stalled, writes are held without acknowledgement. Releasing
    /// the stall applies them in order.
    pub async fn stall_writes(&self, stalled: bool) {
        self.fault(Fault::Stall(stalled)).await;
    }

    /// The next `n` compare-and-set calls lose against a phantom writer.
    pub async fn contend_next_cas(&self, n: u32) {
        self.fault(Fault::Contention(n)).await;
    }

    async fn fault(&self, fault: Fault) {
        let client = self.client;
        self.control(|done| BackendCommand::Fault {
            client,
            fault,
            done,
        })
        .await;
    }
}

fn unexpected(reply: Reply) -> SyncError {
    SyncError::TransientNetwork(format!("unexpected store reply: {reply:?}"))
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn subscribe(&self, path: &str, query: Query) -> SyncResult<Subscription> {
        let sub_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(BackendCommand::Subscribe {
                client: self.client,
                sub_id,
                path: path.to_string(),
                query,
                tx,
            })
            .await
            .map_err(|_| SyncError::TransientNetwork("store unavailable".into()))?;

        let cmd_tx = self.cmd_tx.clone();
        Ok(Subscription::new(path, rx, move || {
            // A full channel is fine: the backend prunes closed receivers.
            let _ = cmd_tx.try_send(BackendCommand::Unsubscribe { sub_id });
        }))
    }

    async fn get(&self, path: &str, query: Query) -> SyncResult<Snapshot> {
        match self
            .request(Op::Get {
                path: path.to_string(),
                query,
            })
            .await?
        {
            Reply::Snapshot(s) => Ok(s),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, path: &str, value: Value) -> SyncResult<WriteAck> {
        match self
            .request(Op::Write {
                path: path.to_string(),
                value,
            })
            .await?
        {
            Reply::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn patch(&self, updates: BTreeMap<String, Value>) -> SyncResult<WriteAck> {
        match self.request(Op::Patch(updates)).await? {
            Reply::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Value>,
        next: Option<Value>,
    ) -> SyncResult<WriteAck> {
        match self
            .request(Op::Cas {
                path: path.to_string(),
                expected,
                next,
            })
            .await?
        {
            Reply::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    async fn reserve_key(&self, _path: &str) -> SyncResult<String> {
        match self.request(Op::ReserveKey).await? {
            Reply::Key(k) => Ok(k),
            other => Err(unexpected(other)),
        }
    }

    async fn register_on_disconnect(&self, path: &str, value: Value) -> SyncResult<()> {
        match self
            .request(Op::OnDisconnect {
                path: path.to_string(),
                value,
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn cancel_on_disconnect(&self, path: &str) -> SyncResult<()> {
        match self
            .request(Op::CancelOnDisconnect {
                path: path.to_string(),
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.conn_rx.clone()
    }

    fn server_now(&self) -> ServerTime {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::server_timestamp_placeholder;

    #[tokio::test]
    async fn subscribe_gets_current_value_then_changes() {
        let backend = MemoryBackend::spawn_with_clock(ServerClock::manual(1_000));
        let remote = backend.connect("alice").await;
        remote.write("a/b", json!(1)).await.unwrap();

        let mut sub = remote.subscribe("a", Query::default()).await.unwrap();
        assert_eq!(sub.next().await.unwrap().value, Some(json!({ "b": 1 })));

        remote.write("a/c", json!(2)).await.unwrap();
        assert_eq!(
            sub.next().await.unwrap().value,
            Some(json!({ "b": 1, "c": 2 }))
        );
    }

    #[tokio::test]
    async fn patch_resolves_one_server_time() {
        let backend = MemoryBackend::spawn_with_clock(ServerClock::manual(5_000));
        let remote = backend.connect("alice").await;
        let mut updates = BTreeMap::new();
        updates.insert("x/t".to_string(), server_timestamp_placeholder());
        updates.insert("y/t".to_string(), server_timestamp_placeholder());
        let ack = remote.patch(updates).await.unwrap();

        assert_eq!(backend.read("x/t").await, Some(json!(ack.server_time.millis())));
        assert_eq!(backend.read("y/t").await, Some(json!(ack.server_time.millis())));
    }

    #[tokio::test]
    async fn offline_requests_fail_transiently() {
        let backend = MemoryBackend::spawn();
        let remote = backend.connect("alice").await;
        remote.set_connected(false).await;
        assert!(!*remote.connection_state().borrow());

        let err = remote.write("a", json!(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn crash_fires_disconnect_hook() {
        let backend = MemoryBackend::spawn();
        let remote = backend.connect("alice").await;
        remote
            .register_on_disconnect("presence/alice", json!({ "online": false }))
            .await
            .unwrap();
        remote.crash().await;

        assert_eq!(
            backend.read("presence/alice").await,
            Some(json!({ "online": false }))
        );
        let log = backend.write_log().await;
        assert_eq!(log.last().unwrap().client, "alice:on-disconnect");
    }

    #[tokio::test]
    async fn cas_rejects_stale_expectation() {
        let backend = MemoryBackend::spawn();
        let remote = backend.connect("alice").await;
        remote.write("n", json!(1)).await.unwrap();

        let err = remote
            .compare_and_set("n", Some(json!(0)), Some(json!(2)))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::ConflictingWrite("n".into()));

        remote
            .compare_and_set("n", Some(json!(1)), Some(json!(2)))
            .await
            .unwrap();
        assert_eq!(backend.read("n").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn stalled_writes_land_when_released() {
        let backend = MemoryBackend::spawn();
        let remote = backend.connect("alice").await;
        remote.stall_writes(true).await;

        let r = remote.clone();
        let pending = tokio::spawn(async move { r.write("late", json!(true)).await });
        tokio::task::yield_now().await;
        assert_eq!(backend.read("late").await, None);

        remote.stall_writes(false).await;
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(backend.read("late").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn reconnect_resends_changed_value() {
        let backend = MemoryBackend::spawn();
        let alice = backend.connect("alice").await;
        let bob = backend.connect("bob").await;

        let mut sub = alice.subscribe("room", Query::default()).await.unwrap();
        assert_eq!(sub.next().await.unwrap().value, None);

        alice.set_connected(false).await;
        bob.write("room/x", json!(1)).await.unwrap();
        alice.set_connected(true).await;

        assert_eq!(sub.next().await.unwrap().value, Some(json!({ "x": 1 })));
    }
}
