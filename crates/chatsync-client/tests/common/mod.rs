#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chatsync_client::{ClientConfig, StaticIdentity, SyncEngine};
use chatsync_remote::{MemoryBackend, MemoryRemote, ServerClock};
use chatsync_shared::record::{decode_message, MessageRecord};
use chatsync_shared::{paths, ConversationId, Message, MessageBody, ServerTime, UserId};
use serde_json::Value;

pub struct Client {
    pub remote: Arc<MemoryRemote>,
    pub identity: Arc<StaticIdentity>,
    pub engine: SyncEngine,
}

pub fn backend() -> Arc<MemoryBackend> {
    MemoryBackend::spawn_with_clock(ServerClock::manual(1_000_000))
}

pub fn config() -> ClientConfig {
    ClientConfig {
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

pub async fn client(backend: &MemoryBackend, user: &str) -> Client {
    client_with(backend, user, config()).await
}

pub async fn client_with_db(backend: &MemoryBackend, user: &str, db: PathBuf) -> Client {
    let config = ClientConfig {
        db_path: Some(db),
        ..config()
    };
    client_with(backend, user, config).await
}

pub async fn client_with(backend: &MemoryBackend, user: &str, config: ClientConfig) -> Client {
    let remote = Arc::new(backend.connect(user).await);
    let identity = Arc::new(StaticIdentity::new(user));
    let engine = SyncEngine::start(remote.clone(), identity.clone(), config)
        .await
        .unwrap();
    Client {
        remote,
        identity,
        engine,
    }
}

/// Poll `check` until it holds. Works with real and paused time.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..3_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..3_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn texts(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m.body() {
            Some(MessageBody::Text { text }) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Confirmed messages as stored, in server order.
pub async fn stored_messages(backend: &MemoryBackend, conversation_id: &ConversationId) -> Vec<Message> {
    let Some(Value::Object(map)) = backend.read(&paths::messages(conversation_id)).await else {
        return Vec::new();
    };
    let mut messages: Vec<Message> = map
        .iter()
        .map(|(key, value)| decode_message(conversation_id, key, value).unwrap())
        .collect();
    messages.sort_by_key(|m| m.created_at_server);
    messages
}

pub async fn stored_texts(backend: &MemoryBackend, conversation_id: &ConversationId) -> Vec<String> {
    texts(&stored_messages(backend, conversation_id).await)
}

pub async fn presence_online(backend: &MemoryBackend, user: &str) -> Option<bool> {
    backend
        .read(&paths::presence(&UserId::from(user)))
        .await
        .and_then(|v| v.get("online").and_then(Value::as_bool))
}

/// A history of `n` messages from bob, stamped 10, 20, 30... and keyed
/// `m001`, `m002`...
pub async fn seed_history(backend: &MemoryBackend, conversation_id: &ConversationId, n: usize) {
    for i in 1..=n {
        let at = i as i64 * 10;
        let mut record = MessageRecord::new(
            &UserId::from("bob"),
            ServerTime(at),
            &MessageBody::text(format!("m{i}")),
            None,
        );
        record.created_at_server = Some(at);
        backend
            .seed(
                &paths::message(conversation_id, &format!("m{i:03}")),
                serde_json::to_value(&record).unwrap(),
            )
            .await;
    }
}
