//! Feed paging through the client: seen-set dedup against live inserts,
//! has_more reporting, cursor reset, and the cursor rebuild a resync
//! forces. Test config pages by 3.

mod support;

use veranda_core::{ProviderEffects, Scope, Table};
use veranda_sync::SyncError;
use veranda_testkit::fixtures;

use support::{settle, Engine};

#[tokio::test]
async fn pages_fold_in_without_duplicates_across_live_inserts() {
    let engine = Engine::start();
    for created in [1_000u64, 2_000, 3_000, 4_000, 5_000] {
        engine
            .provider
            .seed(Table::Posts, fixtures::post().created_at(created).row());
    }
    engine.sign_in().await;

    // The initial resync loads the first page, newest first.
    let feed = engine.client.feed();
    assert_eq!(feed.posts.len(), 3);
    assert!(feed.has_more);

    // A live insert lands before the next fetch, so that page will
    // overlap with what the feed already holds.
    let live = fixtures::post().created_at(6_000);
    engine.provider.seed(Table::Posts, live.row());
    engine.provider.emit_insert(Table::Posts, live.row());
    settle().await;
    assert_eq!(engine.client.feed().posts.len(), 4);

    let has_more = engine.client.fetch_next_page().await.expect("second page");
    assert!(has_more);
    assert_eq!(
        engine.client.feed().posts.len(),
        6,
        "overlapping row deduplicated"
    );

    let has_more = engine.client.fetch_next_page().await.expect("final page");
    assert!(!has_more, "short page exhausts the feed");
    assert_eq!(engine.client.feed().posts.len(), 6);

    // Fetching past the end stays a cheap no-op.
    assert!(!engine.client.fetch_next_page().await.expect("no-op fetch"));
}

#[tokio::test]
async fn failed_page_fetch_leaves_the_cursor_resumable() {
    let engine = Engine::start();
    for created in [1_000u64, 2_000, 3_000, 4_000] {
        engine
            .provider
            .seed(Table::Posts, fixtures::post().created_at(created).row());
    }
    engine.sign_in().await;
    assert_eq!(engine.client.feed().posts.len(), 3);

    engine.provider.fail_next_selects(1);
    let error = engine.client.fetch_next_page().await.unwrap_err();
    assert!(matches!(error, SyncError::Request { .. }));
    assert_eq!(
        engine.client.feed().posts.len(),
        3,
        "no partial page applied"
    );

    // The same window is retried and completes.
    let has_more = engine.client.fetch_next_page().await.expect("retry");
    assert!(!has_more);
    assert_eq!(engine.client.feed().posts.len(), 4);
}

#[tokio::test]
async fn reset_refetches_from_the_top_without_duplicating_known_posts() {
    let engine = Engine::start();
    for created in [1_000u64, 2_000, 3_000] {
        engine
            .provider
            .seed(Table::Posts, fixtures::post().created_at(created).row());
    }
    engine.sign_in().await;
    assert!(!engine.client.fetch_next_page().await.expect("exhaust"));
    assert_eq!(engine.client.feed().posts.len(), 3);

    // A post published since the last visit exists only on the server.
    let fresh = fixtures::post().created_at(9_000);
    engine.provider.seed(Table::Posts, fresh.row());

    engine.client.reset_feed_cursor().await.expect("reset");
    let has_more = engine
        .client
        .fetch_next_page()
        .await
        .expect("first page again");
    assert!(has_more);

    let feed = engine.client.feed();
    assert_eq!(feed.posts.len(), 4, "only the fresh post was added");
    assert_eq!(feed.posts[0].id, fresh.id());

    assert!(!engine.client.fetch_next_page().await.expect("tail"));
    assert_eq!(engine.client.feed().posts.len(), 4);
}

#[tokio::test]
async fn feed_resync_replaces_state_and_rebuilds_the_cursor() {
    let engine = Engine::start();
    let posts: Vec<_> = (1..=4u64)
        .map(|n| fixtures::post().created_at(n * 1_000))
        .collect();
    for post in &posts {
        engine.provider.seed(Table::Posts, post.row());
    }
    engine.sign_in().await;
    assert!(!engine.client.fetch_next_page().await.expect("exhaust"));
    assert_eq!(engine.client.feed().posts.len(), 4);

    // Outage: one post is deleted and another published, all unseen.
    engine.provider.drop_subscriptions(&Scope::feed());
    engine
        .provider
        .delete(Table::Posts, posts[3].id().as_uuid())
        .await
        .expect("server-side delete");
    let fresh = fixtures::post().created_at(9_000);
    engine.provider.seed(Table::Posts, fresh.row());
    settle().await;

    // The resync replaced the feed with the server's first page.
    let feed = engine.client.feed();
    assert_eq!(feed.posts.len(), 3);
    assert!(feed.get(posts[3].id()).is_none(), "deleted post gone");
    assert_eq!(feed.posts[0].id, fresh.id());
    assert!(feed.has_more);

    // Paging resumes below the replaced rows and recovers the tail.
    assert!(!engine.client.fetch_next_page().await.expect("tail"));
    let feed = engine.client.feed();
    assert_eq!(feed.posts.len(), 4);
    assert!(
        feed.get(posts[0].id()).is_some(),
        "older post reloaded after the rebuild"
    );
}
