mod common;

use std::time::Duration;

use serde_json::json;

use chatsync_shared::{paths, Draft, Message, OutboxState, SyncError, TempId, UserId};

use common::{backend, client, eventually, stored_texts, texts};

#[tokio::test]
async fn sends_land_in_submission_order() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();

    for text in ["one", "two", "three", "four", "five"] {
        alice.engine.send(&dm.id, Draft::text(text)).await.unwrap();
    }
    eventually("outbox drained", || alice.engine.pending(&dm.id).is_empty()).await;

    let expected = ["one", "two", "three", "four", "five"];
    assert_eq!(stored_texts(&backend, &dm.id).await, expected);
    let window = alice.engine.window(&dm.id);
    assert_eq!(texts(&window), expected);
    assert!(window.iter().all(Message::is_confirmed));
    assert_eq!(
        backend.read(&paths::unread(&"bob".into(), &dm.id)).await,
        Some(json!(5))
    );
    assert_eq!(backend.read(&paths::unread(&"alice".into(), &dm.id)).await, None);
}

#[tokio::test]
async fn offline_burst_is_delivered_in_order_after_reconnect() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();
    let mut events = alice.engine.events();

    alice.remote.set_connected(false).await;
    let mut temps = Vec::new();
    for text in ["a", "b", "c"] {
        temps.push(alice.engine.send(&dm.id, Draft::text(text)).await.unwrap());
    }
    assert_eq!(texts(&alice.engine.window(&dm.id)), ["a", "b", "c"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stored_texts(&backend, &dm.id).await.is_empty());
    for temp in &temps {
        assert_eq!(alice.engine.outbox_state(*temp), Some(OutboxState::Pending));
    }

    alice.remote.set_connected(true).await;
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            assert_eq!(texts(&alice.engine.window(&dm.id)), ["a", "b", "c"]);
            if alice.engine.pending(&dm.id).is_empty() {
                break;
            }
            let _ = events.recv().await;
        }
    })
    .await;
    assert!(drained.is_ok(), "outbox never drained");

    assert_eq!(stored_texts(&backend, &dm.id).await, ["a", "b", "c"]);
    for temp in &temps {
        assert_eq!(alice.engine.outbox_state(*temp), Some(OutboxState::Confirmed));
    }
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_send_fails_and_retry_lands_once() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();

    alice.remote.stall_writes(true).await;
    let temp = alice.engine.send(&dm.id, Draft::text("hello")).await.unwrap();
    eventually("ack timeout", || {
        alice.engine.outbox_state(temp) == Some(OutboxState::Failed)
    })
    .await;
    let entry = alice.engine.outbox().entry(temp).unwrap();
    assert!(entry.reserved_id.is_some());
    assert_eq!(
        entry.last_error.as_deref(),
        Some("No acknowledgement after 15000 ms")
    );

    // The held write reaches the store late, before the user retries.
    alice.remote.stall_writes(false).await;
    alice.engine.retry(temp).unwrap();
    eventually("confirmation", || {
        alice.engine.outbox_state(temp) == Some(OutboxState::Confirmed)
    })
    .await;

    assert_eq!(stored_texts(&backend, &dm.id).await, ["hello"]);
    assert_eq!(texts(&alice.engine.window(&dm.id)), ["hello"]);
    assert_eq!(
        backend.read(&paths::unread(&"bob".into(), &dm.id)).await,
        Some(json!(1))
    );
}

#[tokio::test]
async fn duplicate_enqueue_and_retry_never_resend() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();
    let outbox = alice.engine.outbox();

    let temp = TempId::new();
    outbox.enqueue_with_id(&dm.id, Draft::text("once"), temp).await.unwrap();
    outbox.enqueue_with_id(&dm.id, Draft::text("once"), temp).await.unwrap();
    eventually("confirmation", || {
        outbox.state(temp) == Some(OutboxState::Confirmed)
    })
    .await;

    alice.engine.retry(temp).unwrap();
    outbox.enqueue_with_id(&dm.id, Draft::text("once"), temp).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(stored_texts(&backend, &dm.id).await, ["once"]);
    assert_eq!(texts(&alice.engine.window(&dm.id)), ["once"]);
}

#[tokio::test]
async fn transient_failures_are_retried_in_place() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();

    alice.remote.fail_next_writes(2).await;
    let temp = alice.engine.send(&dm.id, Draft::text("flaky")).await.unwrap();
    eventually("confirmation", || {
        alice.engine.outbox_state(temp) == Some(OutboxState::Confirmed)
    })
    .await;
    assert_eq!(stored_texts(&backend, &dm.id).await, ["flaky"]);
}

#[tokio::test]
async fn failed_head_holds_back_later_sends_until_discarded() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let bob = client(&backend, "bob").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();

    // Queued while offline, so eligibility is only checked at delivery.
    bob.remote.set_connected(false).await;
    let first = bob.engine.send(&dm.id, Draft::text("first")).await.unwrap();
    let second = bob.engine.send(&dm.id, Draft::text("second")).await.unwrap();
    alice.engine.block(&"bob".into()).await.unwrap();
    bob.remote.set_connected(true).await;

    eventually("head failed", || {
        bob.engine.outbox_state(first) == Some(OutboxState::Failed)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.engine.outbox_state(second), Some(OutboxState::Pending));
    assert!(stored_texts(&backend, &dm.id).await.is_empty());

    alice.engine.unblock(&"bob".into()).await.unwrap();
    bob.engine.discard(first).unwrap();
    eventually("second confirmed", || {
        bob.engine.outbox_state(second) == Some(OutboxState::Confirmed)
    })
    .await;
    assert_eq!(stored_texts(&backend, &dm.id).await, ["second"]);
    assert_eq!(texts(&bob.engine.window(&dm.id)), ["second"]);
    assert_eq!(bob.engine.outbox_state(first), None);
}

#[tokio::test]
async fn blocked_sender_is_refused_before_any_write() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let bob = client(&backend, "bob").await;
    let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();

    alice.engine.block(&"bob".into()).await.unwrap();
    let err = bob.engine.send(&dm.id, Draft::text("hi")).await.unwrap_err();
    assert!(matches!(err, SyncError::Blocked { .. }));
    assert!(bob.engine.pending(&dm.id).is_empty());
    assert!(bob.engine.window(&dm.id).is_empty());

    bob.engine.directory().invalidate(&dm.id);
    bob.engine.directory().refresh(&dm.id).await.unwrap();
    assert!(matches!(
        bob.engine.can_send(&dm.id).await,
        Err(SyncError::Blocked { .. })
    ));

    // Blocking is directed: the blocker may still post.
    alice.engine.can_send(&dm.id).await.unwrap();
    assert!(stored_texts(&backend, &dm.id).await.is_empty());
}

#[tokio::test]
async fn reply_to_a_missing_message_is_rejected() {
    let backend = backend();
    let alice = client(&backend, "alice").await;
    let dm = alice.engine.create_direct(&UserId::from("bob")).await.unwrap();

    let err = alice
        .engine
        .send(&dm.id, Draft::text("re").replying_to("nope"))
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::InvalidReply("nope".into()));
    assert!(alice.engine.window(&dm.id).is_empty());
}

#[tokio::test]
async fn queued_messages_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alice.db");
    let backend = backend();

    let (dm, temp) = {
        let alice = common::client_with_db(&backend, "alice", db.clone()).await;
        let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();
        alice.remote.set_connected(false).await;
        let temp = alice.engine.send(&dm.id, Draft::text("queued")).await.unwrap();
        (dm, temp)
    };

    let alice = common::client_with_db(&backend, "alice", db).await;
    eventually("restored entry confirmed", || {
        alice.engine.outbox_state(temp) == Some(OutboxState::Confirmed)
    })
    .await;
    assert_eq!(stored_texts(&backend, &dm.id).await, ["queued"]);
    assert!(alice
        .engine
        .local_store()
        .lock()
        .unwrap()
        .list_outbox_entries()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn delivered_ids_are_remembered_across_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("alice.db");
    let backend = backend();
    let temp = TempId::new();

    let dm = {
        let alice = common::client_with_db(&backend, "alice", db.clone()).await;
        let dm = alice.engine.create_direct(&"bob".into()).await.unwrap();
        alice
            .engine
            .outbox()
            .enqueue_with_id(&dm.id, Draft::text("once"), temp)
            .await
            .unwrap();
        eventually("confirmation", || {
            alice.engine.outbox_state(temp) == Some(OutboxState::Confirmed)
        })
        .await;
        alice.engine.shutdown().await;
        dm
    };

    let alice = common::client_with_db(&backend, "alice", db).await;
    assert_eq!(alice.engine.outbox_state(temp), Some(OutboxState::Confirmed));
    alice
        .engine
        .outbox()
        .enqueue_with_id(&dm.id, Draft::text("once"), temp)
        .await
        .unwrap();
    alice.engine.retry(temp).unwrap();
    assert!(alice.engine.pending(&dm.id).is_empty());
    assert!(matches!(
        alice.engine.discard(temp),
        Err(SyncError::NotPermitted(_))
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stored_texts(&backend, &dm.id).await, ["once"]);
    assert!(alice.engine.window(&dm.id).is_empty());
}
