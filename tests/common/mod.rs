#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use changefeed::config::EngineConfig;
use changefeed::engine::{DeliveryResponse, Engine};
use changefeed::registry::ProviderRegistry;
use changefeed::secret::{MapSecretsManager, SecretsManager};
use changefeed::store::{MemoryStore, Store};
use changefeed::subscription_config::SubscriptionConfig;
use serde_json::{Value, json};
use trigger_plugin::message::{Delivery, DispatchedEvent, Subscription};
use trigger_plugin::plugin_test_util::FakeProvider;

pub const SIGNING_SECRET: &str = "fake-signing-key";

pub struct Harness {
    pub engine: Arc<Engine>,
    pub fake: Arc<FakeProvider>,
    pub store: Arc<dyn Store>,
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        provider_timeout: Duration::from_secs(2),
        retry_max_attempts: 2,
        retry_base: Duration::from_millis(1),
        retry_max: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}

pub fn harness(fake: FakeProvider) -> Harness {
    harness_with(Arc::new(fake), MemoryStore::new())
}

/// Lets a test share one fake feed across engines, e.g. to simulate a restart.
pub fn harness_with(fake: Arc<FakeProvider>, store: Arc<dyn Store>) -> Harness {
    let mut registry = ProviderRegistry::new();
    registry.register(fake.clone());
    let secrets = SecretsManager(MapSecretsManager::new().with("FAKE_SIGNING", SIGNING_SECRET));
    let engine = Engine::new(store.clone(), registry, secrets, &engine_config()).unwrap();
    Harness { engine, fake, store }
}

/// A fake-provider subscription authenticated by an `X-Token` header.
pub fn token_config(resource: &str, events: &str) -> SubscriptionConfig {
    SubscriptionConfig::from_yaml(&format!(
        r#"
provider: fake
scope: {{ resource: {resource} }}
callback_url: https://hooks.example.com/fake
authenticity: {{ mode: shared_token, location: {{ in: header, name: X-Token }} }}
events:
{events}
"#
    ))
    .unwrap()
}

/// Same feed, but deliveries must carry a hex HMAC-SHA256 of the body.
pub fn signed_config(resource: &str, events: &str) -> SubscriptionConfig {
    SubscriptionConfig::from_yaml(&format!(
        r#"
provider: fake
scope: {{ resource: {resource} }}
callback_url: https://hooks.example.com/fake
authenticity: {{ mode: hmac, secret: FAKE_SIGNING, header: X-Signature, prefix: "sha256=" }}
events:
{events}
"#
    ))
    .unwrap()
}

pub const MAILBOX_EVENTS: &str = r#"
  - event_type: message_added
    families: [message-added]
    fields:
      - { name: history_id, source: { from: cursor } }
      - { name: message_id, source: { from: payload, path: id } }
      - { name: subject, source: { from: payload, path: subject } }
  - event_type: label_removed
    families: [label-removed]
    fields:
      - { name: history_id, source: { from: cursor } }
      - { name: message_id, source: { from: payload, path: id } }
"#;

pub fn notify(subscription: &Subscription, body: Value) -> Delivery {
    Delivery::post(body.to_string()).with_header("X-Token", subscription.verification_secret.clone())
}

pub fn changed(subscription: &Subscription) -> Delivery {
    notify(subscription, json!({"changed": true}))
}

pub fn events(response: DeliveryResponse) -> Vec<DispatchedEvent> {
    match response {
        DeliveryResponse::Events { events } => events,
        other => panic!("expected events, got {other:?}"),
    }
}
