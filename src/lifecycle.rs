use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{error, info, warn};
use trigger_plugin::message::{Subscription, SubscriptionStatus};
use trigger_plugin::oauth::TokenGrant;
use trigger_plugin::plugin::{Provider, RenewalMode, SubscribeRequest};
use uuid::Uuid;

use crate::credential::CredentialManager;
use crate::error::EngineError;
use crate::logger::EngineMetrics;
use crate::registry::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::store::{Store, StoredCredential};
use crate::subscription_config::{CONFIG_PROPERTY, SubscriptionConfig};

/// Property recording when a worker claimed a subscription for renewal.
const RENEWAL_CLAIM: &str = "renewal_claimed_at";
/// A claim older than this is assumed abandoned by a crashed worker.
const CLAIM_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub enum RenewalOutcome {
    /// Still outside the renewal window; nothing was called.
    NotDue { expires_at: Option<DateTime<Utc>> },
    Renewed(Subscription),
    /// Another worker holds the renewal claim.
    InProgress,
}

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialManager>,
    policy: RetryPolicy,
    min_margin: Duration,
    metrics: EngineMetrics,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialManager>,
        policy: RetryPolicy,
        min_margin: std::time::Duration,
        metrics: EngineMetrics,
    ) -> Self {
        let min_margin = Duration::from_std(min_margin).unwrap_or_else(|_| Duration::hours(1));
        Self { store, registry, credentials, policy, min_margin, metrics }
    }

    /// Registers a watch, stores the subscription with its baseline checkpoint, then
    /// retires any older live subscription on the same scope.
    pub async fn provision(&self, config: &SubscriptionConfig, tokens: Option<TokenGrant>) -> Result<Subscription, EngineError> {
        config.validate()?;
        let provider = self.registry.get(&config.provider)?;
        let subscription_id = Uuid::new_v4().to_string();
        let verification_secret = hex::encode(rand::random::<[u8; 32]>());

        let mut subscription = Subscription {
            subscription_id: subscription_id.clone(),
            provider_id: config.provider.clone(),
            resource_scope: config.scope.clone(),
            callback_url: config.callback_url.clone(),
            external_channel_id: None,
            external_resource_id: None,
            expires_at: None,
            renewed_at: Utc::now(),
            verification_secret: verification_secret.clone(),
            status: SubscriptionStatus::Pending,
            properties: [(CONFIG_PROPERTY.to_string(), config.to_value()?)].into_iter().collect(),
            version: 0,
        };
        self.store.insert_subscription(&subscription).await?;
        if let Some(grant) = tokens {
            self.store
                .put_credential(&StoredCredential {
                    subscription_id: subscription_id.clone(),
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token,
                    expires_at: grant.expires_at,
                    version: 0,
                })
                .await?;
        }

        let request = SubscribeRequest {
            subscription_id: subscription_id.clone(),
            scope: config.scope.clone(),
            callback_url: config.callback_url.clone(),
            verification_secret,
            channel_id: Uuid::new_v4().to_string(),
        };
        let established = async {
            let ctx = self.credentials.call_context(&subscription, config, provider.as_ref()).await?;
            let grant = self
                .policy
                .run(&subscription_id, || provider.subscribe(&ctx, &request))
                .await
                .map_err(|e| EngineError::from_provider(e, &subscription_id, provider.id()))?;
            let baseline = match grant.baseline.clone() {
                Some(cursor) => cursor,
                None => self
                    .policy
                    .run(&subscription_id, || provider.baseline(&ctx, &subscription))
                    .await
                    .map_err(|e| EngineError::from_provider(e, &subscription_id, provider.id()))?,
            };
            Ok::<_, EngineError>((grant, baseline))
        }
        .await;

        let (grant, baseline) = match established {
            Ok(pair) => pair,
            Err(err) => {
                error!(subscription_id = %subscription_id, provider = %config.provider, error = %err, "provisioning failed");
                subscription.status = SubscriptionStatus::Revoked;
                if let Err(e) = self.store.update_subscription(&subscription).await {
                    warn!(subscription_id = %subscription_id, "could not mark failed subscription revoked: {e}");
                }
                return Err(err);
            }
        };

        subscription.external_channel_id = grant.external_channel_id;
        subscription.external_resource_id = grant.external_resource_id;
        subscription.expires_at = grant.expires_at;
        subscription.renewed_at = Utc::now();
        subscription.status = SubscriptionStatus::Active;
        subscription.properties.extend(grant.properties);
        let subscription = self.store.update_subscription(&subscription).await?;
        self.store.create_checkpoint(&subscription_id, &baseline).await?;
        info!(
            subscription_id = %subscription_id,
            provider = %config.provider,
            cursor = %baseline,
            expires_at = ?subscription.expires_at,
            "subscription active"
        );

        self.supersede(&subscription, config, provider.as_ref()).await;
        Ok(subscription)
    }

    /// Tears down older live channels on the same (provider, scope).
    async fn supersede(&self, current: &Subscription, config: &SubscriptionConfig, provider: &dyn Provider) {
        let scope_key = current.resource_scope.key();
        let older = match self.store.find_live(&current.provider_id, &scope_key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(subscription_id = %current.subscription_id, "looking up superseded subscriptions failed: {e}");
                return;
            }
        };
        for old in older.into_iter().filter(|s| s.subscription_id != current.subscription_id) {
            info!(old = %old.subscription_id, new = %current.subscription_id, "superseding subscription");
            self.teardown(&old, config, provider, old.external_channel_id.as_deref(), old.external_resource_id.as_deref())
                .await;
            if let Err(e) = self.mark_revoked(&old.subscription_id).await {
                warn!(subscription_id = %old.subscription_id, "could not revoke superseded subscription: {e}");
            }
        }
    }

    /// How long before `expires_at` renewal starts.
    pub fn renewal_window(&self, subscription: &Subscription, config: &SubscriptionConfig) -> Duration {
        if let Some(secs) = config.renewal_window_secs {
            return Duration::seconds(secs as i64);
        }
        let Some(expires_at) = subscription.expires_at else {
            return self.min_margin;
        };
        let validity = expires_at - subscription.renewed_at;
        (validity / 10).max(self.min_margin)
    }

    pub async fn renew(&self, subscription_id: &str) -> Result<RenewalOutcome, EngineError> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("subscription {subscription_id}")))?;
        if !subscription.status.is_live() {
            return Err(EngineError::NotFound(format!("live subscription {subscription_id}")));
        }
        let config = SubscriptionConfig::of(&subscription)?;
        let Some(expires_at) = subscription.expires_at else {
            return Ok(RenewalOutcome::NotDue { expires_at: None });
        };
        let now = Utc::now();
        if now < expires_at - self.renewal_window(&subscription, &config) {
            return Ok(RenewalOutcome::NotDue { expires_at: Some(expires_at) });
        }

        let Some(claimed) = self.claim(subscription, now).await? else {
            return Ok(RenewalOutcome::InProgress);
        };
        let provider = self.registry.get(&claimed.provider_id)?;
        let mode = provider.renewal_mode();
        let channel_id = match (mode, claimed.external_channel_id.as_deref()) {
            (RenewalMode::ExtendInPlace, Some(current)) => current.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let attempt = async {
            let ctx = self.credentials.call_context(&claimed, &config, provider.as_ref()).await?;
            self.policy
                .run(subscription_id, || provider.renew(&ctx, &claimed, &channel_id))
                .await
                .map_err(|e| EngineError::from_provider(e, subscription_id, provider.id()))
        }
        .await;

        let grant = match attempt {
            Ok(grant) => grant,
            Err(err) => return Err(self.escalate(claimed, err).await),
        };

        let mut renewed = claimed.clone();
        renewed.status = SubscriptionStatus::Active;
        renewed.expires_at = grant.expires_at.or(claimed.expires_at);
        renewed.renewed_at = Utc::now();
        renewed.external_channel_id = grant.external_channel_id.or(claimed.external_channel_id.clone());
        renewed.external_resource_id = grant.external_resource_id.or(claimed.external_resource_id.clone());
        renewed.properties.remove(RENEWAL_CLAIM);
        renewed.properties.extend(grant.properties);
        let renewed = self.store.update_subscription(&renewed).await?;
        info!(subscription_id, expires_at = ?renewed.expires_at, "subscription renewed");

        // the new channel is persisted, so the old one can go
        if mode == RenewalMode::Reallocate && renewed.external_channel_id != claimed.external_channel_id {
            self.teardown(
                &claimed,
                &config,
                provider.as_ref(),
                claimed.external_channel_id.as_deref(),
                claimed.external_resource_id.as_deref(),
            )
            .await;
        }
        Ok(RenewalOutcome::Renewed(renewed))
    }

    /// Marks the subscription as expiring under this worker's claim. `None` when
    /// another worker holds a fresh claim or won the race.
    async fn claim(&self, subscription: Subscription, now: DateTime<Utc>) -> Result<Option<Subscription>, EngineError> {
        if subscription.status == SubscriptionStatus::Expiring {
            let held_since = subscription
                .property_str(RENEWAL_CLAIM)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc));
            if held_since.is_some_and(|t| now - t < Duration::seconds(CLAIM_TTL_SECS)) {
                return Ok(None);
            }
        }
        let mut claimed = subscription;
        claimed.status = SubscriptionStatus::Expiring;
        claimed.properties.insert(RENEWAL_CLAIM.to_string(), json!(now.to_rfc3339()));
        match self.store.update_subscription(&claimed).await {
            Ok(stored) => Ok(Some(stored)),
            Err(EngineError::VersionConflict(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// A lapsed channel stops delivering silently, so failure is made loud.
    async fn escalate(&self, claimed: Subscription, err: EngineError) -> EngineError {
        let subscription_id = claimed.subscription_id.clone();
        let mut revoked = claimed;
        revoked.status = SubscriptionStatus::Revoked;
        revoked.properties.remove(RENEWAL_CLAIM);
        if let Err(e) = self.store.update_subscription(&revoked).await {
            warn!(subscription_id = %subscription_id, "could not record revocation: {e}");
        }
        self.metrics.renewals_failed.add(1, &[]);
        error!(
            subscription_id = %subscription_id,
            provider = %revoked.provider_id,
            error = %err,
            "ALERT: renewal failed, subscription revoked and deliveries will stop"
        );
        match err {
            EngineError::CredentialExpired { .. } => err,
            other => EngineError::RenewalExhausted {
                subscription_id,
                attempts: self.policy.max_attempts,
                reason: other.to_string(),
            },
        }
    }

    /// Stops the provider channel (best effort) and revokes locally.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<Subscription, EngineError> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("subscription {subscription_id}")))?;
        if subscription.status == SubscriptionStatus::Revoked {
            return Ok(subscription);
        }
        match (SubscriptionConfig::of(&subscription), self.registry.get(&subscription.provider_id)) {
            (Ok(config), Ok(provider)) => {
                self.teardown(
                    &subscription,
                    &config,
                    provider.as_ref(),
                    subscription.external_channel_id.as_deref(),
                    subscription.external_resource_id.as_deref(),
                )
                .await
            }
            (Err(e), _) | (_, Err(e)) => warn!(subscription_id, "skipping provider teardown: {e}"),
        }
        let revoked = self.mark_revoked(subscription_id).await?;
        self.store.delete_credential(subscription_id).await?;
        info!(subscription_id, "subscription revoked");
        Ok(revoked)
    }

    async fn teardown(
        &self,
        subscription: &Subscription,
        config: &SubscriptionConfig,
        provider: &dyn Provider,
        channel_id: Option<&str>,
        resource_id: Option<&str>,
    ) {
        if let Some(channel) = channel_id {
            match self.channel_in_use(subscription, channel).await {
                Ok(false) => {}
                Ok(true) => {
                    info!(
                        subscription_id = %subscription.subscription_id,
                        channel,
                        "channel still serves another live subscription, leaving it running"
                    );
                    return;
                }
                Err(e) => {
                    warn!(subscription_id = %subscription.subscription_id, channel, "skipping teardown, channel sharing unknown: {e}");
                    return;
                }
            }
        }
        let result = async {
            let ctx = self.credentials.call_context(subscription, config, provider).await?;
            self.policy
                .run(&subscription.subscription_id, || provider.unsubscribe(&ctx, subscription, channel_id, resource_id))
                .await
                .map_err(|e| EngineError::from_provider(e, &subscription.subscription_id, provider.id()))
        }
        .await;
        if let Err(e) = result {
            warn!(
                subscription_id = %subscription.subscription_id,
                channel = ?channel_id,
                "provider teardown failed, revoking locally anyway: {e}"
            );
        }
    }

    /// Providers with one watch per mailbox hand every subscription on it the same
    /// channel id; stopping it for one would stop it for all.
    async fn channel_in_use(&self, subscription: &Subscription, channel_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.list_subscriptions().await?.iter().any(|other| {
            other.subscription_id != subscription.subscription_id
                && other.provider_id == subscription.provider_id
                && other.status.is_live()
                && other.external_channel_id.as_deref() == Some(channel_id)
        }))
    }

    async fn mark_revoked(&self, subscription_id: &str) -> Result<Subscription, EngineError> {
        loop {
            let mut current = self
                .store
                .get_subscription(subscription_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("subscription {subscription_id}")))?;
            if current.status == SubscriptionStatus::Revoked {
                return Ok(current);
            }
            current.status = SubscriptionStatus::Revoked;
            current.properties.remove(RENEWAL_CLAIM);
            match self.store.update_subscription(&current).await {
                Err(EngineError::VersionConflict(_)) => continue,
                other => return other,
            }
        }
    }
}
