//! Cross-actor disconnect tests.
//!
//! A single registry unregister fans out to every actor. These tests check
//! the combined effect using the `TestRtcCore` harness.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::{ChannelId, MessageId};
use rtc_service::actors::{CallState, MessageTable};
use rtc_test_utils::{camera, declared_size, full_chunk, InMemoryStore, TestRtcCore};

/// Caller in an active call, member of two channels and mid-upload.
#[tokio::test]
async fn test_disconnect_cleans_up_call_channels_and_upload() {
    let message_id = MessageId::new();
    let store =
        InMemoryStore::new().with_message(MessageTable::Room, message_id, declared_size(3, 10));
    let core = TestRtcCore::spawn(store.clone());
    let alice = core.connect().await;
    let mut bob = core.connect().await;
    let mut carol = core.connect().await;
    let mut dave = core.connect().await;

    core.calls.initiate(alice.user_id, bob.user_id).await.unwrap();
    core.calls
        .respond(alice.user_id, bob.user_id, true)
        .await
        .unwrap();

    let first = ChannelId::new();
    let second = ChannelId::new();
    core.channels.join(first, carol.user_id, camera("c")).await.unwrap();
    core.channels.join(first, alice.user_id, camera("a")).await.unwrap();
    core.channels.join(second, dave.user_id, camera("d")).await.unwrap();
    core.channels.join(second, alice.user_id, camera("a")).await.unwrap();

    for _ in 0..2 {
        core.attachments
            .submit_chunk(full_chunk(
                alice.user_id,
                message_id,
                MessageTable::Room,
                &[carol.user_id],
            ))
            .await
            .unwrap();
    }
    assert_eq!(store.chunk_count(message_id), 2);
    for client in [&mut bob, &mut carol, &mut dave] {
        client.drain();
    }

    core.disconnect(&alice).await;
    core.settle().await;

    assert_eq!(bob.take_events_of("CALL_LEFT").len(), 1);
    assert_eq!(carol.take_events_of("CHANNEL_WEBRTC_LEFT").len(), 1);
    assert_eq!(dave.take_events_of("CHANNEL_WEBRTC_LEFT").len(), 1);

    assert_eq!(core.calls.get_state().await.unwrap(), CallState::default());
    assert!(!core.channels.members(first).await.unwrap().contains(&alice.user_id));
    assert!(!core.channels.members(second).await.unwrap().contains(&alice.user_id));
    assert!(core.attachments.in_flight(alice.user_id).await.unwrap().is_empty());
    assert_eq!(store.chunk_count(message_id), 0);
    assert!(store.metadata(MessageTable::Room, message_id).unwrap().failed);
}

#[tokio::test]
async fn test_disconnect_of_idle_user_notifies_nobody() {
    let core = TestRtcCore::spawn(InMemoryStore::new());
    let alice = core.connect().await;
    let mut bob = core.connect().await;

    core.disconnect(&alice).await;
    core.settle().await;

    assert!(bob.drain().is_empty());
}

/// A replaced connection closing later must not tear down the user's state.
#[tokio::test]
async fn test_stale_connection_close_keeps_state() {
    let core = TestRtcCore::spawn(InMemoryStore::new());
    let old = core.connect().await;
    let new = core.connect_as(old.user_id).await;
    let mut bob = core.connect().await;

    core.calls.initiate(new.user_id, bob.user_id).await.unwrap();
    core.calls
        .respond(new.user_id, bob.user_id, true)
        .await
        .unwrap();
    bob.drain();

    core.disconnect(&old).await;
    core.settle().await;

    assert!(bob.drain().is_empty());
    assert_eq!(
        core.calls.get_state().await.unwrap().active,
        vec![(new.user_id, bob.user_id)]
    );
    assert!(core.registry.is_online(new.user_id).await);
}

#[tokio::test]
async fn test_shutdown_stops_every_actor_cleanly() {
    let core = TestRtcCore::spawn(InMemoryStore::new());
    let exits = core.shutdown().await;
    assert_eq!(exits.len(), 3);
    assert!(exits
        .iter()
        .all(|exit| *exit == rtc_service::actors::SupervisorExit::Completed));
}
