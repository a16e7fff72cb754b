//! The per-invocation entry points the host calls: one delivery, one renewal
//! sweep, provisioning and teardown. Nothing is kept between calls except what the
//! store holds.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use trigger_plugin::message::{Checkpoint, Delivery, DeliveryHint, DispatchedEvent, Subscription, SubscriptionStatus};
use trigger_plugin::oauth::TokenGrant;
use trigger_plugin::plugin::CallContext;

use crate::config::EngineConfig;
use crate::credential::CredentialManager;
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::lifecycle::{LifecycleManager, RenewalOutcome};
use crate::logger::EngineMetrics;
use crate::reconcile::{Reconciler, Reconciliation};
use crate::registry::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::secret::SecretsManager;
use crate::store::Store;
use crate::subscription_config::SubscriptionConfig;
use crate::verify::{Verdict, Verifier, body_handshake, query_handshake};

/// What the host should do with an inbound request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryResponse {
    /// Answer the provider's registration challenge with `body`.
    Handshake { body: String },
    /// Reconciled; may be empty when the notification was a duplicate.
    Events { events: Vec<DispatchedEvent> },
    /// Authentic but nothing to reconcile.
    Acknowledged { reason: String },
    /// Not for a live subscription.
    Ignored { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub subscription: Subscription,
    pub checkpoint: Option<Checkpoint>,
}

pub struct Engine {
    store: Arc<dyn Store>,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialManager>,
    verifier: Verifier,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    lifecycle: LifecycleManager,
    metrics: EngineMetrics,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ProviderRegistry,
        secrets: SecretsManager,
        config: &EngineConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let http = CallContext::http_client(config.provider_timeout)
            .map_err(|e| EngineError::InvalidConfig(format!("http client: {e}")))?;
        let registry = Arc::new(registry);
        let policy = RetryPolicy::from_config(config);
        let metrics = EngineMetrics::new();
        let credentials = Arc::new(CredentialManager::new(
            store.clone(),
            secrets.clone(),
            http.clone(),
            policy.clone(),
            config.conflict_retries,
        ));

        Ok(Arc::new(Self {
            verifier: Verifier::new(secrets, http),
            reconciler: Reconciler::new(store.clone(), registry.clone(), policy.clone(), config.conflict_retries),
            dispatcher: Dispatcher::new(store.clone(), config.dedupe_retention, metrics.clone()),
            lifecycle: LifecycleManager::new(
                store.clone(),
                registry.clone(),
                credentials.clone(),
                policy,
                config.renewal_min_margin,
                metrics.clone(),
            ),
            store,
            registry,
            credentials,
            metrics,
        }))
    }

    pub async fn handle_delivery(&self, subscription_id: &str, delivery: Delivery) -> Result<DeliveryResponse, EngineError> {
        self.metrics.deliveries_received.add(1, &[]);
        self.metrics
            .instrument("deliver", subscription_id, || self.process_delivery(subscription_id, &delivery))
            .await
    }

    async fn process_delivery(&self, subscription_id: &str, delivery: &Delivery) -> Result<DeliveryResponse, EngineError> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(DeliveryResponse::Ignored { reason: format!("unknown subscription {subscription_id}") });
        };
        if subscription.status == SubscriptionStatus::Revoked {
            return Ok(DeliveryResponse::Ignored { reason: "subscription is revoked".into() });
        }
        let config = SubscriptionConfig::of(&subscription)?;

        match query_handshake(&subscription, &config, delivery) {
            Some(Ok(challenge)) => return Ok(DeliveryResponse::Handshake { body: challenge }),
            Some(Err(reason)) => return Err(EngineError::AuthenticationFailed(reason)),
            None => {}
        }

        if let Verdict::Rejected(reason) = self.verifier.verify(&subscription, &config, delivery).await {
            return Err(EngineError::AuthenticationFailed(reason));
        }

        if let Some(challenge) = body_handshake(&config, &delivery.body) {
            return Ok(DeliveryResponse::Handshake { body: challenge });
        }
        if let Some(header) = &config.retry_header
            && delivery.header(header).is_some()
        {
            debug!(subscription_id, header = %header, "provider redelivery acknowledged");
            return Ok(DeliveryResponse::Acknowledged { reason: format!("redelivery marked by {header}") });
        }

        let provider = self.registry.get(&subscription.provider_id)?;
        let hinted = match provider.parse_hint(&subscription, delivery) {
            Ok(DeliveryHint::Sync) => {
                return Ok(DeliveryResponse::Acknowledged { reason: "channel sync".into() });
            }
            Ok(DeliveryHint::Changed { cursor }) => cursor,
            Err(e) => {
                warn!(subscription_id, error = %e, "unreadable notification, reconciling anyway");
                None
            }
        };

        let ctx = self.credentials.call_context(&subscription, &config, provider.as_ref()).await?;
        let events = match self.reconciler.reconcile(provider.as_ref(), &ctx, &subscription, hinted.as_ref()).await? {
            Reconciliation::Changes { cursor, records, skipped, .. } => {
                if skipped > 0 {
                    warn!(subscription_id, skipped, "some changes could not be classified");
                }
                self.dispatcher.dispatch(&subscription, &config, &cursor, &records).await
            }
            Reconciliation::Gap { previous, baseline } => {
                self.dispatcher.gap(&subscription, &previous, &baseline).await.into_iter().collect()
            }
            Reconciliation::Unchanged { .. } | Reconciliation::Baseline { .. } | Reconciliation::Covered { .. } => Vec::new(),
        };
        Ok(DeliveryResponse::Events { events })
    }

    pub async fn provision(&self, config: &SubscriptionConfig, tokens: Option<TokenGrant>) -> Result<Subscription, EngineError> {
        self.lifecycle.provision(config, tokens).await
    }

    pub async fn renew(&self, subscription_id: &str) -> Result<RenewalOutcome, EngineError> {
        self.metrics
            .instrument("renew", subscription_id, || self.lifecycle.renew(subscription_id))
            .await
    }

    /// One scheduler tick: every live subscription inside its window is renewed.
    /// A failure on one subscription never stops the sweep.
    pub async fn renew_due(&self) -> Result<Vec<(String, Result<RenewalOutcome, EngineError>)>, EngineError> {
        let mut results = Vec::new();
        for subscription in self.store.list_subscriptions().await? {
            if !subscription.status.is_live() {
                continue;
            }
            let id = subscription.subscription_id;
            let outcome = self.renew(&id).await;
            if let Ok(RenewalOutcome::Renewed(renewed)) = &outcome {
                info!(subscription_id = %id, expires_at = ?renewed.expires_at, "renewed by sweep");
            }
            results.push((id, outcome));
        }
        Ok(results)
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<Subscription, EngineError> {
        self.lifecycle.unsubscribe(subscription_id).await
    }

    pub async fn status(&self, subscription_id: &str) -> Result<StatusReport, EngineError> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("subscription {subscription_id}")))?;
        let checkpoint = self.store.read_checkpoint(subscription_id).await?;
        Ok(StatusReport { subscription, checkpoint })
    }

    pub async fn list(&self) -> Result<Vec<Subscription>, EngineError> {
        self.store.list_subscriptions().await
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
