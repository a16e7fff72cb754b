use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::Barrier;

use crate::{
    message::{ChangePage, ChangeRecord, ChannelGrant, Cursor, Delivery, DeliveryHint, RawChange, Subscription},
    plugin::{CallContext, ClassifyFn, Provider, ProviderError, RenewalMode, SubscribeRequest},
};

struct Feed {
    start: u64,
    entries: Vec<(u64, RawChange)>,
    expired_before: Option<u64>,
}

impl Feed {
    fn head(&self) -> u64 {
        self.entries.last().map(|(seq, _)| *seq).unwrap_or(self.start)
    }
}

/// Scripted in-memory provider with a numeric feed.
///
/// Changes pushed with [`FakeProvider::push`] get consecutive sequence numbers after
/// the starting cursor. Every trait call is counted so tests can assert that a path
/// made no provider call at all.
pub struct FakeProvider {
    id: String,
    mode: RenewalMode,
    page_size: usize,
    lifetime: Duration,
    feed: Mutex<Feed>,
    calls: DashMap<&'static str, usize>,
    subscribe_failures: AtomicUsize,
    renew_failures: AtomicUsize,
    revoked: AtomicBool,
    barrier: Mutex<Option<(Arc<Barrier>, usize)>>,
}

impl FakeProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            mode: RenewalMode::ExtendInPlace,
            page_size: 50,
            lifetime: Duration::days(6),
            feed: Mutex::new(Feed { start: 0, entries: vec![], expired_before: None }),
            calls: DashMap::new(),
            subscribe_failures: AtomicUsize::new(0),
            renew_failures: AtomicUsize::new(0),
            revoked: AtomicBool::new(false),
            barrier: Mutex::new(None),
        }
    }

    pub fn starting_at(self, cursor: u64) -> Self {
        if let Ok(mut feed) = self.feed.lock() {
            feed.start = cursor;
        }
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_renewal_mode(mut self, mode: RenewalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Appends a change and returns its sequence number.
    pub fn push(&self, kind: &str, id: &str, payload: Value) -> u64 {
        let mut feed = self.feed.lock().unwrap();
        let seq = feed.head() + 1;
        let mut body = payload;
        if let Value::Object(map) = &mut body {
            map.insert("id".into(), json!(id));
        }
        feed.entries.push((seq, RawChange::new(kind, Some(seq.to_string()), body)));
        seq
    }

    pub fn head(&self) -> Cursor {
        Cursor::new(self.feed.lock().unwrap().head().to_string())
    }

    /// Cursors strictly below `cursor` are reported as expired.
    pub fn expire_before(&self, cursor: u64) {
        self.feed.lock().unwrap().expired_before = Some(cursor);
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.subscribe_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_renewals(&self, n: usize) {
        self.renew_failures.store(n, Ordering::SeqCst);
    }

    /// Every subsequent call fails with `CredentialExpired`.
    pub fn revoke_credentials(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// The next `parties` first-page reads wait for each other before answering.
    pub fn arm_barrier(&self, parties: usize) {
        *self.barrier.lock().unwrap() = Some((Arc::new(Barrier::new(parties)), parties));
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.get(op).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|c| *c.value()).sum()
    }

    fn record(&self, op: &'static str) -> Result<(), ProviderError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ProviderError::CredentialExpired("refresh token revoked".into()));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_barrier(&self) -> Option<Arc<Barrier>> {
        let mut slot = self.barrier.lock().unwrap();
        let (barrier, remaining) = slot.as_mut()?;
        let barrier = barrier.clone();
        *remaining -= 1;
        if *remaining == 0 {
            *slot = None;
        }
        Some(barrier)
    }

    fn grant(&self, channel_id: &str) -> ChannelGrant {
        ChannelGrant {
            external_channel_id: Some(channel_id.to_string()),
            external_resource_id: Some(format!("res-{}", uuid::Uuid::new_v4())),
            expires_at: Some(Utc::now() + self.lifetime),
            baseline: Some(self.head()),
            ..Default::default()
        }
    }
}

fn passthrough(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    let change_id = raw
        .body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Decode(format!("{} change without id", raw.kind)))?;
    Ok(ChangeRecord {
        change_id: change_id.to_string(),
        family: raw.kind.clone(),
        payload: raw.body.clone(),
        sequence_hint: raw.sequence_hint.clone(),
    })
}

fn always_malformed(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    Err(ProviderError::Decode(format!("cannot classify {}", raw.kind)))
}

#[async_trait]
impl Provider for FakeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn renewal_mode(&self) -> RenewalMode {
        self.mode
    }

    fn token_endpoint(&self) -> Option<&str> {
        None
    }

    async fn subscribe(&self, _ctx: &CallContext, request: &SubscribeRequest) -> Result<ChannelGrant, ProviderError> {
        self.record("subscribe")?;
        if Self::take_failure(&self.subscribe_failures) {
            return Err(ProviderError::Unavailable("scripted subscribe failure".into()));
        }
        Ok(self.grant(&request.channel_id))
    }

    async fn renew(&self, _ctx: &CallContext, subscription: &Subscription, channel_id: &str) -> Result<ChannelGrant, ProviderError> {
        self.record("renew")?;
        if Self::take_failure(&self.renew_failures) {
            return Err(ProviderError::Unavailable("scripted renew failure".into()));
        }
        let mut grant = self.grant(channel_id);
        if self.mode == RenewalMode::ExtendInPlace {
            grant.external_channel_id = subscription.external_channel_id.clone();
            grant.external_resource_id = subscription.external_resource_id.clone();
        }
        grant.baseline = None;
        Ok(grant)
    }

    async fn unsubscribe(
        &self,
        _ctx: &CallContext,
        _subscription: &Subscription,
        _external_channel_id: Option<&str>,
        _external_resource_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.record("unsubscribe")
    }

    async fn baseline(&self, _ctx: &CallContext, _subscription: &Subscription) -> Result<Cursor, ProviderError> {
        self.record("baseline")?;
        Ok(self.head())
    }

    async fn list_changes(
        &self,
        _ctx: &CallContext,
        _subscription: &Subscription,
        cursor: &Cursor,
        page_token: Option<&str>,
    ) -> Result<ChangePage, ProviderError> {
        self.record("list_changes")?;
        if page_token.is_none() {
            if let Some(barrier) = self.take_barrier() {
                barrier.wait().await;
            }
        }

        let after: u64 = cursor
            .as_str()
            .parse()
            .map_err(|_| ProviderError::Rejected { status: 400, body: format!("bad cursor {cursor}") })?;
        let feed = self.feed.lock().unwrap();
        if feed.expired_before.is_some_and(|floor| after < floor) {
            return Err(ProviderError::CursorExpired(cursor.to_string()));
        }

        let pending: Vec<&RawChange> = feed
            .entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .map(|(_, change)| change)
            .collect();
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + self.page_size).min(pending.len());
        let changes = pending.get(offset..end).unwrap_or_default().iter().map(|c| (*c).clone()).collect();
        let next_page_token = (end < pending.len()).then(|| end.to_string());

        Ok(ChangePage {
            changes,
            cursor: next_page_token.is_none().then(|| Cursor::new(feed.head().to_string())),
            next_page_token,
        })
    }

    fn parse_hint(&self, _subscription: &Subscription, delivery: &Delivery) -> Result<DeliveryHint, ProviderError> {
        let body: Value = serde_json::from_slice(&delivery.body)?;
        if body.get("sync").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(DeliveryHint::Sync);
        }
        let cursor = match body.get("cursor") {
            Some(Value::String(s)) => Some(Cursor::new(s.clone())),
            Some(Value::Number(n)) => Some(Cursor::new(n.to_string())),
            _ => None,
        };
        Ok(DeliveryHint::Changed { cursor })
    }

    fn classifiers(&self) -> Vec<(&'static str, ClassifyFn)> {
        vec![
            ("message-added", passthrough as ClassifyFn),
            ("message-deleted", passthrough),
            ("label-added", passthrough),
            ("label-removed", passthrough),
            ("malformed", always_malformed),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResourceScope;

    fn subscription() -> Subscription {
        Subscription {
            subscription_id: "s1".into(),
            provider_id: "fake".into(),
            resource_scope: ResourceScope::new("me"),
            callback_url: "https://hooks.example/s1".into(),
            external_channel_id: None,
            external_resource_id: None,
            expires_at: None,
            renewed_at: Utc::now(),
            verification_secret: "secret".into(),
            status: Default::default(),
            properties: Default::default(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn pages_drain_to_head() {
        let fake = FakeProvider::new("fake").starting_at(100).with_page_size(1);
        fake.push("message-added", "a", json!({}));
        fake.push("label-removed", "b", json!({}));
        let ctx = CallContext::new(reqwest::Client::new(), "t");
        let sub = subscription();

        let first = fake.list_changes(&ctx, &sub, &Cursor::new("100"), None).await.unwrap();
        assert_eq!(first.changes.len(), 1);
        assert!(first.cursor.is_none());
        let token = first.next_page_token.unwrap();
        let second = fake.list_changes(&ctx, &sub, &Cursor::new("100"), Some(&token)).await.unwrap();
        assert_eq!(second.changes[0].kind, "label-removed");
        assert_eq!(second.cursor, Some(Cursor::new("102")));
        assert_eq!(fake.calls("list_changes"), 2);
    }

    #[tokio::test]
    async fn expired_cursor_is_reported() {
        let fake = FakeProvider::new("fake").starting_at(100);
        fake.expire_before(90);
        let ctx = CallContext::new(reqwest::Client::new(), "t");
        let err = fake.list_changes(&ctx, &subscription(), &Cursor::new("80"), None).await.unwrap_err();
        assert!(matches!(err, ProviderError::CursorExpired(_)));
    }
}
