mod common;

use std::collections::HashSet;

use changefeed::dispatch::GAP_EVENT;
use changefeed::store::CheckpointStore;
use common::*;
use serde_json::json;
use trigger_plugin::message::{Cursor, VariableValue};
use trigger_plugin::plugin_test_util::FakeProvider;

#[tokio::test]
async fn expired_cursors_reset_the_checkpoint_and_surface_a_gap() {
    let h = harness(FakeProvider::new("fake").starting_at(100));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    for i in 0..5 {
        h.fake.push("message-added", &format!("m{i}"), json!({}));
    }
    h.fake.expire_before(103);

    let out = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert_eq!(out.len(), 1);
    let gap = &out[0];
    assert_eq!(gap.event_type, GAP_EVENT);
    assert_eq!(gap.variables["previous_cursor"], VariableValue::from("100"));
    assert_eq!(gap.variables["new_cursor"], VariableValue::from("105"));
    assert_eq!(gap.variables["subscription_id"], VariableValue::from(sub.subscription_id.as_str()));

    let checkpoint = h.store.read_checkpoint(&sub.subscription_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, Cursor::new("105"));
    assert!(checkpoint.last_reset_at.is_some());

    // the feed continues normally from the new baseline
    h.fake.push("message-added", "after", json!({}));
    let next = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].source_change_id, "after");
}

#[tokio::test]
async fn committed_cursors_never_move_backwards() {
    let h = harness(FakeProvider::new("fake").starting_at(10));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();

    let mut seen = vec![];
    for round in 0..4 {
        for i in 0..round {
            h.fake.push("message-added", &format!("r{round}-{i}"), json!({}));
        }
        h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap();
        let cursor = h.store.read_checkpoint(&sub.subscription_id).await.unwrap().unwrap().cursor;
        seen.push(cursor.as_str().parse::<u64>().unwrap());
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "cursors went backwards: {seen:?}");
    assert_eq!(seen.last(), Some(&16));
}

#[tokio::test]
async fn a_provider_cursor_behind_the_checkpoint_is_not_committed() {
    let h = harness(FakeProvider::new("fake").starting_at(100));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    h.store
        .commit(&sub.subscription_id, &Cursor::new("100"), &Cursor::new("200"))
        .await
        .unwrap();

    let out = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert!(out.is_empty());
    let checkpoint = h.store.read_checkpoint(&sub.subscription_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, Cursor::new("200"));
}

#[tokio::test]
async fn every_page_is_drained_before_committing() {
    let h = harness(FakeProvider::new("fake").with_page_size(2));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    for i in 0..5 {
        h.fake.push("message-added", &format!("m{i}"), json!({}));
    }

    let out = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    let ids: Vec<&str> = out.iter().map(|e| e.source_change_id.as_str()).collect();
    assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(h.fake.calls("list_changes"), 3);
    assert!(out.iter().all(|e| e.variables["history_id"] == VariableValue::Integer(5)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_passes_advance_once_and_never_double_dispatch() {
    let h = harness(FakeProvider::new("fake").starting_at(100));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    h.fake.push("message-added", "A", json!({}));
    h.fake.push("label-removed", "B", json!({}));
    h.fake.arm_barrier(2);

    let id = sub.subscription_id.clone();
    let (left, right) = tokio::join!(
        h.engine.handle_delivery(&id, notify(&sub, json!({"cursor": "102"}))),
        h.engine.handle_delivery(&id, notify(&sub, json!({"cursor": "102"}))),
    );
    let mut all = events(left.unwrap());
    all.extend(events(right.unwrap()));

    assert_eq!(all.len(), 2);
    let keys: HashSet<&str> = all.iter().map(|e| e.dedupe_key.as_str()).collect();
    assert_eq!(keys.len(), 2);
    let checkpoint = h.store.read_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, Cursor::new("102"));
}
