use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use moka::Expiry;
use moka::future::Cache;
use trigger_plugin::message::{Checkpoint, Cursor, Subscription};

use super::{CheckpointStore, CredentialStore, DedupeLedger, StoredCredential, SubscriptionStore};
use crate::error::EngineError;

/// Each ledger entry carries its own retention as the cached value.
struct RetentionExpiry;

impl Expiry<String, Duration> for RetentionExpiry {
    fn expire_after_create(&self, _key: &String, retention: &Duration, _created_at: Instant) -> Option<Duration> {
        Some(*retention)
    }
}

/// Process-local store. Shares state between clones, not between processes.
///
/// The ledger has no size bound: entries leave only when their retention lapses,
/// so memory grows with the event rate times the retention.
#[derive(Clone)]
pub struct MemoryStore {
    subscriptions: Arc<DashMap<String, Subscription>>,
    checkpoints: Arc<DashMap<String, Checkpoint>>,
    credentials: Arc<DashMap<String, StoredCredential>>,
    ledger: Cache<String, Duration>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: Arc::new(DashMap::new()),
            checkpoints: Arc::new(DashMap::new()),
            credentials: Arc::new(DashMap::new()),
            ledger: Cache::builder().expire_after(RetentionExpiry).build(),
        })
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), EngineError> {
        match self.subscriptions.entry(subscription.subscription_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::VersionConflict(format!(
                "subscription {}",
                subscription.subscription_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(subscription.clone());
                Ok(())
            }
        }
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>, EngineError> {
        Ok(self.subscriptions.get(subscription_id).map(|s| s.clone()))
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<Subscription, EngineError> {
        let id = &subscription.subscription_id;
        let mut stored = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("subscription {id}")))?;
        if stored.version != subscription.version {
            return Err(EngineError::VersionConflict(format!("subscription {id}")));
        }
        let mut next = subscription.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn find_live(&self, provider_id: &str, scope_key: &str) -> Result<Vec<Subscription>, EngineError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.provider_id == provider_id && s.status.is_live() && s.resource_scope.key() == scope_key)
            .map(|s| s.clone())
            .collect())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, EngineError> {
        let mut all: Vec<Subscription> = self.subscriptions.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        Ok(all)
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn read_checkpoint(&self, subscription_id: &str) -> Result<Option<Checkpoint>, EngineError> {
        Ok(self.checkpoints.get(subscription_id).map(|c| c.clone()))
    }

    async fn create_checkpoint(&self, subscription_id: &str, cursor: &Cursor) -> Result<Checkpoint, EngineError> {
        let checkpoint = self
            .checkpoints
            .entry(subscription_id.to_string())
            .or_insert_with(|| Checkpoint {
                subscription_id: subscription_id.to_string(),
                cursor: cursor.clone(),
                updated_at: Utc::now(),
                last_reset_at: None,
            });
        Ok(checkpoint.clone())
    }

    async fn commit(&self, subscription_id: &str, expected: &Cursor, new: &Cursor) -> Result<Checkpoint, EngineError> {
        let mut stored = self
            .checkpoints
            .get_mut(subscription_id)
            .ok_or_else(|| EngineError::NotFound(format!("checkpoint {subscription_id}")))?;
        if &stored.cursor != expected {
            return Err(EngineError::CheckpointConflict(subscription_id.to_string()));
        }
        stored.cursor = new.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn reset(&self, subscription_id: &str, expected: &Cursor, baseline: &Cursor) -> Result<Checkpoint, EngineError> {
        let mut stored = self
            .checkpoints
            .get_mut(subscription_id)
            .ok_or_else(|| EngineError::NotFound(format!("checkpoint {subscription_id}")))?;
        if &stored.cursor != expected {
            return Err(EngineError::CheckpointConflict(subscription_id.to_string()));
        }
        let now = Utc::now();
        stored.cursor = baseline.clone();
        stored.updated_at = now;
        stored.last_reset_at = Some(now);
        Ok(stored.clone())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_credential(&self, subscription_id: &str) -> Result<Option<StoredCredential>, EngineError> {
        Ok(self.credentials.get(subscription_id).map(|c| c.clone()))
    }

    async fn put_credential(&self, credential: &StoredCredential) -> Result<StoredCredential, EngineError> {
        let mut slot = self
            .credentials
            .entry(credential.subscription_id.clone())
            .or_insert_with(|| StoredCredential { version: 0, ..credential.clone() });
        let version = slot.version + 1;
        *slot = StoredCredential { version, ..credential.clone() };
        Ok(slot.clone())
    }

    async fn swap_credential(&self, expected_version: u64, credential: &StoredCredential) -> Result<StoredCredential, EngineError> {
        let id = &credential.subscription_id;
        let mut stored = self
            .credentials
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("credential for {id}")))?;
        if stored.version != expected_version {
            return Err(EngineError::VersionConflict(format!("credential for {id}")));
        }
        *stored = StoredCredential { version: expected_version + 1, ..credential.clone() };
        Ok(stored.clone())
    }

    async fn delete_credential(&self, subscription_id: &str) -> Result<(), EngineError> {
        self.credentials.remove(subscription_id);
        Ok(())
    }
}

#[async_trait]
impl DedupeLedger for MemoryStore {
    async fn record_if_new(&self, dedupe_key: &str, retention: Duration) -> Result<bool, EngineError> {
        let entry = self
            .ledger
            .entry(dedupe_key.to_string())
            .or_insert_with(async move { retention })
            .await;
        Ok(entry.is_fresh())
    }
}
