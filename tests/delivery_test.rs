mod common;

use changefeed::engine::DeliveryResponse;
use changefeed::error::EngineError;
use changefeed::store::CheckpointStore;
use common::*;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use trigger_plugin::message::{Cursor, Delivery, VariableValue};
use trigger_plugin::plugin_test_util::FakeProvider;

#[tokio::test]
async fn two_changes_commit_the_cursor_and_replays_yield_nothing() {
    let h = harness(FakeProvider::new("fake").starting_at(100));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();

    h.fake.push("message-added", "A", json!({"subject": "hello"}));
    h.fake.push("label-removed", "B", json!({"labelIds": ["UNREAD"]}));

    let first = events(h.engine.handle_delivery(&sub.subscription_id, notify(&sub, json!({"cursor": "102"}))).await.unwrap());
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].event_type, "message_added");
    assert_eq!(first[0].variables["message_id"], VariableValue::from("A"));
    assert_eq!(first[0].variables["subject"], VariableValue::from("hello"));
    assert_eq!(first[1].event_type, "label_removed");
    assert_eq!(first[1].variables["message_id"], VariableValue::from("B"));
    assert!(first.iter().all(|e| e.variables["history_id"] == VariableValue::Integer(102)));

    let checkpoint = h.store.read_checkpoint(&sub.subscription_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, Cursor::new("102"));

    let again = events(h.engine.handle_delivery(&sub.subscription_id, notify(&sub, json!({"cursor": "102"}))).await.unwrap());
    assert!(again.is_empty());
}

#[tokio::test]
async fn redelivered_changes_are_collapsed_by_the_ledger() {
    let h = harness(FakeProvider::new("fake").starting_at(100));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    h.fake.push("message-added", "A", json!({}));

    let first = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert_eq!(first.len(), 1);

    // rewind so the same change is listed again
    h.store
        .commit(&sub.subscription_id, &Cursor::new("101"), &Cursor::new("100"))
        .await
        .unwrap();
    let second = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert!(second.is_empty());
    assert_eq!(h.fake.calls("list_changes"), 2);
}

#[tokio::test]
async fn one_change_fans_out_to_two_event_types() {
    let h = harness(FakeProvider::new("fake"));
    let config = token_config(
        "me",
        r#"
  - { event_type: label_added, families: [label-added] }
  - { event_type: message_touched, families: [label-added, message-added] }
"#,
    );
    let sub = h.engine.provision(&config, None).await.unwrap();
    h.fake.push("label-added", "m7", json!({"labelIds": ["STARRED"]}));

    let out = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert_eq!(out.len(), 2);
    assert_ne!(out[0].dedupe_key, out[1].dedupe_key);
    assert!(out.iter().all(|e| e.source_change_id == "m7"));
}

#[tokio::test]
async fn tampered_signatures_are_rejected_before_any_provider_call() {
    let h = harness(FakeProvider::new("fake"));
    let sub = h.engine.provision(&signed_config("me", MAILBOX_EVENTS), None).await.unwrap();
    h.fake.push("message-added", "A", json!({}));
    let calls_after_provision = h.fake.total_calls();

    let body = br#"{"cursor":"1"}"#.to_vec();
    let mut mac = Hmac::<Sha256>::new_from_slice(SIGNING_SECRET.as_bytes()).unwrap();
    mac.update(&body);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let mut tampered = body.clone();
    tampered[2] = b'C';
    let forged = Delivery::post(tampered).with_header("X-Signature", signature.clone());
    let err = h.engine.handle_delivery(&sub.subscription_id, forged).await.unwrap_err();
    assert!(matches!(err, EngineError::AuthenticationFailed(_)));
    assert_eq!(h.fake.total_calls(), calls_after_provision);

    let genuine = Delivery::post(body).with_header("X-Signature", signature);
    let out = events(h.engine.handle_delivery(&sub.subscription_id, genuine).await.unwrap());
    assert_eq!(out.len(), 1);
}

#[tokio::test]
async fn sync_messages_and_redeliveries_are_acknowledged_without_reconciling() {
    let h = harness(FakeProvider::new("fake"));
    let mut config = token_config("me", MAILBOX_EVENTS);
    config.retry_header = Some("X-Retry-Num".into());
    let sub = h.engine.provision(&config, None).await.unwrap();

    let sync = h.engine.handle_delivery(&sub.subscription_id, notify(&sub, json!({"sync": true}))).await.unwrap();
    assert!(matches!(sync, DeliveryResponse::Acknowledged { .. }));

    let retry = changed(&sub).with_header("X-Retry-Num", "1");
    let retried = h.engine.handle_delivery(&sub.subscription_id, retry).await.unwrap();
    assert!(matches!(retried, DeliveryResponse::Acknowledged { .. }));
    assert_eq!(h.fake.calls("list_changes"), 0);
}

#[tokio::test]
async fn one_malformed_change_does_not_block_the_batch() {
    let h = harness(FakeProvider::new("fake"));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    h.fake.push("malformed", "x", json!({}));
    h.fake.push("message-added", "A", json!({}));

    let out = events(h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap());
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].source_change_id, "A");
    let checkpoint = h.store.read_checkpoint(&sub.subscription_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, h.fake.head());
}

#[tokio::test]
async fn deliveries_for_unknown_or_revoked_subscriptions_are_ignored() {
    let h = harness(FakeProvider::new("fake"));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();

    let unknown = h.engine.handle_delivery("nope", changed(&sub)).await.unwrap();
    assert!(matches!(unknown, DeliveryResponse::Ignored { .. }));

    h.engine.unsubscribe(&sub.subscription_id).await.unwrap();
    let revoked = h.engine.handle_delivery(&sub.subscription_id, changed(&sub)).await.unwrap();
    assert!(matches!(revoked, DeliveryResponse::Ignored { .. }));
}

#[tokio::test]
async fn wrong_verification_token_is_an_authentication_failure() {
    let h = harness(FakeProvider::new("fake"));
    let sub = h.engine.provision(&token_config("me", MAILBOX_EVENTS), None).await.unwrap();
    let forged = Delivery::post(r#"{"cursor":"5"}"#).with_header("X-Token", "guess");
    let err = h.engine.handle_delivery(&sub.subscription_id, forged).await.unwrap_err();
    assert!(err.user_message().contains("verification secret"));
    assert_eq!(h.fake.calls("list_changes"), 0);
}
