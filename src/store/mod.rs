//! Durable state: subscriptions, checkpoints, per-subscription credentials and the
//! dedupe ledger.
//!
//! Every cross-invocation guarantee is expressed as a compare-and-swap against one
//! of these records, so two processes sharing a backend never need a lock of their own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trigger_plugin::message::{Checkpoint, Cursor, Subscription};

use crate::error::EngineError;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Fails if the id is already taken.
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), EngineError>;

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>, EngineError>;

    /// Writes `subscription` if the stored version still equals `subscription.version`.
    /// Returns the stored record with its version bumped, or `VersionConflict`.
    async fn update_subscription(&self, subscription: &Subscription) -> Result<Subscription, EngineError>;

    /// Active or expiring subscriptions for one (provider, scope key).
    async fn find_live(&self, provider_id: &str, scope_key: &str) -> Result<Vec<Subscription>, EngineError>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, EngineError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read_checkpoint(&self, subscription_id: &str) -> Result<Option<Checkpoint>, EngineError>;

    /// Creates the checkpoint if none exists. Returns the checkpoint now stored.
    async fn create_checkpoint(&self, subscription_id: &str, cursor: &Cursor) -> Result<Checkpoint, EngineError>;

    /// Atomic compare-and-swap. `CheckpointConflict` when `expected` is stale.
    async fn commit(&self, subscription_id: &str, expected: &Cursor, new: &Cursor) -> Result<Checkpoint, EngineError>;

    /// Like `commit`, but records the jump as a reset.
    async fn reset(&self, subscription_id: &str, expected: &Cursor, baseline: &Cursor) -> Result<Checkpoint, EngineError>;
}

/// Access/refresh token pair owned by one subscription.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub subscription_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("subscription_id", &self.subscription_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("version", &self.version)
            .finish()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, subscription_id: &str) -> Result<Option<StoredCredential>, EngineError>;

    /// Unconditional write (operator action); bumps the version.
    async fn put_credential(&self, credential: &StoredCredential) -> Result<StoredCredential, EngineError>;

    /// Replaces the credential only if the stored version equals `expected_version`.
    async fn swap_credential(&self, expected_version: u64, credential: &StoredCredential) -> Result<StoredCredential, EngineError>;

    async fn delete_credential(&self, subscription_id: &str) -> Result<(), EngineError>;
}

#[async_trait]
pub trait DedupeLedger: Send + Sync {
    /// Records `dedupe_key` for `retention`. True when the key was not already present.
    async fn record_if_new(&self, dedupe_key: &str, retention: Duration) -> Result<bool, EngineError>;
}

/// One backend serving every store concern.
pub trait Store: SubscriptionStore + CheckpointStore + CredentialStore + DedupeLedger {}

impl<T: SubscriptionStore + CheckpointStore + CredentialStore + DedupeLedger> Store for T {}
