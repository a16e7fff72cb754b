mod common;

use std::sync::Arc;

use changefeed::store::{CheckpointStore, SqliteStore};
use common::*;
use serde_json::json;
use trigger_plugin::message::Cursor;
use trigger_plugin::plugin_test_util::FakeProvider;

#[tokio::test]
async fn state_survives_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state").join("changefeed.db");
    let fake = Arc::new(FakeProvider::new("fake").starting_at(7));

    let first = harness_with(fake.clone(), SqliteStore::open(&db).unwrap());
    let sub = first.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    fake.push("message-added", "A", json!({}));
    let out = events(first.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert_eq!(out.len(), 1);
    drop(first);

    let second = harness_with(fake.clone(), SqliteStore::open(&db).unwrap());
    let status = second.engine.status(&sub.subscription_id).await.unwrap();
    assert_eq!(status.subscription.verification_secret, sub.verification_secret);
    assert_eq!(status.checkpoint.map(|c| c.cursor), Some(Cursor::new("8")));

    // a fresh process replaying the same change still dispatches it only once
    second
        .store
        .commit(&sub.subscription_id, &Cursor::new("8"), &Cursor::new("7"))
        .await
        .unwrap();
    let replay = events(second.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert!(replay.is_empty());
}
