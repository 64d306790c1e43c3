//! End-to-end optimistic mutations: the local effect lands first, the
//! provider write runs behind it, and the state settles against the
//! server's echo or rolls back on failure.

mod support;

use veranda_core::{like_row_id, Table, Timestamp};
use veranda_sync::{Mutation, SyncError};
use veranda_testkit::fixtures;

use support::{settle, Engine};

#[tokio::test]
async fn like_confirms_against_request_and_echo_without_double_count() {
    let engine = Engine::start();
    let post = fixtures::post().created_at(5_000).counts(2, 0, 0);
    engine.provider.seed(Table::Posts, post.row());
    engine.sign_in().await;

    engine
        .client
        .perform(Mutation::Like { post: post.id() })
        .await
        .expect("like confirms");
    settle().await;

    // The optimistic increment and the echoed absolute counters agree.
    let feed = engine.client.feed();
    let liked = feed.get(post.id()).expect("post stays in the feed");
    assert_eq!(liked.like_count, 3);
    assert!(liked.viewer_has_liked);
    assert_eq!(liked.rank_score, 6.0);

    let row_id = like_row_id(post.id(), engine.viewer);
    assert!(
        engine.provider.stored_row(Table::Likes, row_id).is_some(),
        "interaction row persisted"
    );
}

#[tokio::test]
async fn failed_like_rolls_back_to_server_truth() {
    let engine = Engine::start();
    let post = fixtures::post().created_at(5_000).counts(5, 0, 0);
    engine.provider.seed(Table::Posts, post.row());
    engine.sign_in().await;

    engine.provider.fail_next_inserts(1);
    let error = engine
        .client
        .perform(Mutation::Like { post: post.id() })
        .await
        .unwrap_err();
    assert!(matches!(error, SyncError::Request { .. }));
    settle().await;

    let feed = engine.client.feed();
    let restored = feed.get(post.id()).expect("post stays in the feed");
    assert_eq!(restored.like_count, 5);
    assert!(!restored.viewer_has_liked);
    assert_eq!(restored.rank_score, 10.0);
    assert!(engine
        .provider
        .stored_row(Table::Likes, like_row_id(post.id(), engine.viewer))
        .is_none());
}

#[tokio::test]
async fn unlike_removes_the_interaction_row_and_settles_counters() {
    let engine = Engine::start();
    let post = fixtures::post()
        .created_at(5_000)
        .counts(1, 0, 0)
        .liked_by_viewer();
    engine.provider.seed(Table::Posts, post.row());
    engine
        .provider
        .seed(Table::Likes, fixtures::like_row(post.id(), engine.viewer));
    engine.sign_in().await;

    engine
        .client
        .perform(Mutation::Unlike { post: post.id() })
        .await
        .expect("unlike confirms");
    settle().await;

    let feed = engine.client.feed();
    let cleared = feed.get(post.id()).expect("post stays in the feed");
    assert_eq!(cleared.like_count, 0);
    assert!(!cleared.viewer_has_liked);
    assert!(engine
        .provider
        .stored_row(Table::Likes, like_row_id(post.id(), engine.viewer))
        .is_none());
}

#[tokio::test]
async fn send_message_lands_in_the_thread_and_the_chat_summary() {
    let engine = Engine::start();
    let chat = fixtures::chat().created_at(1_000).participant(engine.viewer);
    engine.provider.seed(Table::Chats, chat.row());
    engine.sign_in().await;

    engine.client.open_chat(chat.id()).expect("open chat");
    settle().await;

    engine
        .client
        .perform(Mutation::SendMessage {
            chat: chat.id(),
            content: "on my way".to_string(),
        })
        .await
        .expect("send confirms");
    settle().await;

    let chats = engine.client.chats();
    let thread = chats.thread(chat.id());
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].content, "on my way");
    assert_eq!(thread[0].sender_id, engine.viewer);
    assert_eq!(thread[0].created_at, Timestamp::from_millis(100_000));

    let summary = chats.chat(chat.id()).expect("chat listed");
    assert_eq!(
        summary.last_message.as_ref().map(|m| m.content.as_str()),
        Some("on my way")
    );

    assert!(
        engine
            .provider
            .stored_row(Table::Messages, thread[0].id.as_uuid())
            .is_some(),
        "message row persisted"
    );
}

#[tokio::test]
async fn sign_out_fails_mutations_still_in_flight() {
    let engine = Engine::start();
    let post = fixtures::post().created_at(5_000);
    engine.provider.seed(Table::Posts, post.row());
    engine.sign_in().await;

    engine.provider.hold_writes();
    let in_flight = {
        let client = engine.client.clone();
        let id = post.id();
        tokio::spawn(async move { client.perform(Mutation::Like { post: id }).await })
    };
    settle().await;
    assert_eq!(engine.provider.insert_attempts(), 1, "write started");

    engine.client.sign_out().await.expect("sign out");
    engine.provider.release_writes();

    let result = in_flight.await.expect("task joins");
    assert!(matches!(result, Err(SyncError::NoSession { .. })));
    assert!(
        engine.client.feed().posts.is_empty(),
        "feed cleared on sign-out"
    );
}
