mod common;

use std::collections::HashSet;

use serde_json::{json, Value};

use chatsync_client::{ClientConfig, SyncEvent, WindowStatus};
use chatsync_shared::{paths, ConversationId, Draft, Message, MessageId, OutboxState};

use common::{backend, client, client_with, eventually, seed_history, stored_texts, texts};

fn ids(messages: &[Message]) -> HashSet<MessageId> {
    messages.iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn confirmed_message_appears_once_after_reload() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();

    let temp = alice.engine.send(&dm.id, Draft::text("hi")).await.unwrap();
    eventually("confirmation", || {
        alice.engine.outbox_state(temp) == Some(OutboxState::Confirmed)
    })
    .await;

    let load = alice.engine.open_conversation(&dm.id).await;
    assert_eq!(load.status, WindowStatus::Live);
    assert_eq!(texts(&load.messages), ["hi"]);
    assert!(load.messages[0].is_confirmed());
    assert_eq!(texts(&alice.engine.window(&dm.id)), ["hi"]);
}

#[tokio::test]
async fn live_echo_and_ack_collapse_into_one_message() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();
    let _load = alice.engine.open_conversation(&dm.id).await;

    for text in ["x", "y", "z"] {
        alice.engine.send(&dm.id, Draft::text(text)).await.unwrap();
    }
    eventually("outbox drained", || alice.engine.pending(&dm.id).is_empty()).await;
    eventually("window confirmed", || {
        alice.engine.window(&dm.id).iter().all(Message::is_confirmed)
    })
    .await;
    assert_eq!(texts(&alice.engine.window(&dm.id)), ["x", "y", "z"]);
}

#[tokio::test]
async fn other_clients_messages_arrive_live() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let bob = client(&backend, "bob").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();

    let load = bob.engine.open_conversation(&dm.id).await;
    assert!(load.messages.is_empty());
    assert!(load.handle.is_active());

    alice.engine.send(&dm.id, Draft::text("ping")).await.unwrap();
    eventually("live delivery", || texts(&bob.engine.window(&dm.id)) == ["ping"]).await;

    // Closing the handle stops live delivery.
    load.handle.close();
    alice.engine.send(&dm.id, Draft::text("pong")).await.unwrap();
    eventually("pong stored", || alice.engine.pending(&dm.id).is_empty()).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(texts(&bob.engine.window(&dm.id)), ["ping"]);
}

#[tokio::test]
async fn older_pages_walk_back_to_a_stable_end() {
    let backend = backend();
    let config = ClientConfig {
        page_size: 10,
        ..common::config()
    };
    let alice = client_with(&backend, "alice", config).await;
    let group = alice
        .engine
        .create_group("team", &["bob".into()])
        .await
        .unwrap();
    seed_history(&backend, &group.id, 25).await;

    let load = alice.engine.open_conversation(&group.id).await;
    assert_eq!(texts(&load.messages).first().map(String::as_str), Some("m16"));
    assert_eq!(load.messages.len(), 10);

    let mut seen = ids(&load.messages);
    let mut before = load.messages[0].created_at_server.unwrap();

    let page = alice.engine.load_older_page(&group.id, before).await.unwrap();
    assert_eq!(page.messages.len(), 10);
    assert!(!page.exhausted);
    assert_eq!(texts(&page.messages).first().map(String::as_str), Some("m6"));
    assert!(ids(&page.messages).is_disjoint(&seen));
    seen.extend(ids(&page.messages));
    before = page.messages[0].created_at_server.unwrap();

    let page = alice.engine.load_older_page(&group.id, before).await.unwrap();
    assert_eq!(texts(&page.messages), ["m1", "m2", "m3", "m4", "m5"]);
    assert!(page.exhausted);
    assert!(ids(&page.messages).is_disjoint(&seen));
    before = page.messages[0].created_at_server.unwrap();

    for _ in 0..2 {
        let page = alice.engine.load_older_page(&group.id, before).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(page.exhausted);
    }

    let window = alice.engine.window(&group.id);
    assert_eq!(window.len(), 25);
    assert_eq!(ids(&window).len(), 25);
    assert!(window
        .windows(2)
        .all(|w| w[0].created_at_server < w[1].created_at_server));
}

#[tokio::test]
async fn undecodable_records_do_not_end_history_early() {
    let backend = backend();
    let config = ClientConfig {
        page_size: 10,
        ..common::config()
    };
    let alice = client_with(&backend, "alice", config).await;
    let group = alice
        .engine
        .create_group("team", &["bob".into()])
        .await
        .unwrap();
    seed_history(&backend, &group.id, 25).await;
    backend
        .seed(
            &paths::message(&group.id, "m010b"),
            json!({ "createdAtServer": 105, "createdAtClient": 105 }),
        )
        .await;

    let load = alice.engine.open_conversation(&group.id).await;
    assert_eq!(load.messages.len(), 10);
    let before = load.messages[0].created_at_server.unwrap();

    let page = alice.engine.load_older_page(&group.id, before).await.unwrap();
    assert_eq!(page.messages.len(), 10);
    assert!(!page.exhausted);
    assert_eq!(texts(&page.messages).first().map(String::as_str), Some("m6"));
    let before = page.messages[0].created_at_server.unwrap();

    let page = alice.engine.load_older_page(&group.id, before).await.unwrap();
    assert_eq!(texts(&page.messages), ["m1", "m2", "m3", "m4", "m5"]);
    assert!(page.exhausted);
    assert_eq!(alice.engine.window(&group.id).len(), 25);
}

#[tokio::test]
async fn missing_conversation_yields_an_empty_removed_window() {
    let backend = backend();
    let alice = client(&backend, "alice").await;

    let load = alice.engine.open_conversation(&ConversationId::from("ghost")).await;
    assert_eq!(load.status, WindowStatus::Removed);
    assert!(load.messages.is_empty());
    assert!(!load.handle.is_active());
}

#[tokio::test]
async fn removal_while_open_clears_the_cache() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let group = alice
        .engine
        .create_group("team", &["bob".into()])
        .await
        .unwrap();
    seed_history(&backend, &group.id, 3).await;
    let mut events = alice.engine.events();

    let load = alice.engine.open_conversation(&group.id).await;
    assert_eq!(load.messages.len(), 3);

    backend.seed(&paths::conversation(&group.id), Value::Null).await;
    eventually("removal", || alice.engine.cache().is_removed(&group.id)).await;
    assert!(alice.engine.window(&group.id).is_empty());

    let mut signalled = false;
    while let Ok(event) = events.try_recv() {
        if event == (SyncEvent::ConversationRemoved { conversation_id: group.id.clone() }) {
            signalled = true;
        }
    }
    assert!(signalled);
}

#[tokio::test]
async fn offline_open_serves_the_local_copy_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alice.db");
    let backend = backend();

    let dm = {
        let alice = common::client_with_db(&backend, "alice", db.clone()).await;
        let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();
        alice.engine.send(&dm.id, Draft::text("persisted")).await.unwrap();
        eventually("outbox drained", || alice.engine.pending(&dm.id).is_empty()).await;
        alice.engine.shutdown().await;
        dm
    };

    let alice = common::client_with_db(&backend, "alice", db).await;
    alice.remote.set_connected(false).await;
    let load = alice.engine.open_conversation(&dm.id).await;
    assert_eq!(load.status, WindowStatus::Offline);
    assert_eq!(texts(&load.messages), ["persisted"]);

    let bob = client(&backend, "bob").await;
    bob.engine.send(&dm.id, Draft::text("while away")).await.unwrap();
    eventually("bob's message stored", || bob.engine.pending(&dm.id).is_empty()).await;
    assert_eq!(stored_texts(&backend, &dm.id).await, ["persisted", "while away"]);

    alice.remote.set_connected(true).await;
    eventually("window recovered", || {
        texts(&alice.engine.window(&dm.id)) == ["persisted", "while away"]
    })
    .await;
    assert!(load.handle.is_active());
}

#[tokio::test]
async fn corrupt_local_copy_is_dropped_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alice.db");
    let backend = backend();

    let dm = {
        let alice = common::client_with_db(&backend, "alice", db.clone()).await;
        let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();
        alice.engine.send(&dm.id, Draft::text("persisted")).await.unwrap();
        eventually("outbox drained", || alice.engine.pending(&dm.id).is_empty()).await;
        alice.engine.shutdown().await;
        dm
    };

    let alice = common::client_with_db(&backend, "alice", db).await;
    let cached = |alice: &common::Client| {
        alice
            .engine
            .local_store()
            .lock()
            .unwrap()
            .cached_window(&dm.id, 10)
    };
    alice
        .engine
        .local_store()
        .lock()
        .unwrap()
        .conn()
        .execute("UPDATE cached_messages SET record = 'not json'", [])
        .unwrap();
    assert!(cached(&alice).is_err());

    alice.remote.set_connected(false).await;
    let load = alice.engine.open_conversation(&dm.id).await;
    assert_eq!(load.status, WindowStatus::Offline);
    assert!(load.messages.is_empty());
    assert!(cached(&alice).unwrap().is_empty());

    alice.remote.set_connected(true).await;
    eventually("window reloaded", || {
        texts(&alice.engine.window(&dm.id)) == ["persisted"]
    })
    .await;
    assert_eq!(texts(&cached(&alice).unwrap()), ["persisted"]);
    assert!(load.handle.is_active());
}
