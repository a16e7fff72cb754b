use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use trigger_plugin::message::Subscription;
use trigger_plugin::oauth::{OAuthClient, refresh_access_token};
use trigger_plugin::plugin::{CallContext, Provider};

use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::secret::SecretsManager;
use crate::store::{Store, StoredCredential};
use crate::subscription_config::SubscriptionConfig;

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Hands out bearer tokens scoped to one subscription, refreshing them in place.
pub struct CredentialManager {
    store: Arc<dyn Store>,
    secrets: SecretsManager,
    http: reqwest::Client,
    policy: RetryPolicy,
    conflict_retries: u32,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn Store>,
        secrets: SecretsManager,
        http: reqwest::Client,
        policy: RetryPolicy,
        conflict_retries: u32,
    ) -> Self {
        Self { store, secrets, http, policy, conflict_retries }
    }

    /// A currently valid access token for `subscription`.
    ///
    /// Concurrent refreshes race on the stored credential version; the loser re-reads
    /// and uses the winner's token instead of recording its own.
    pub async fn get_valid_token(
        &self,
        subscription: &Subscription,
        config: &SubscriptionConfig,
        token_endpoint: Option<&str>,
    ) -> Result<String, EngineError> {
        let id = &subscription.subscription_id;
        let expired = |reason: &str| EngineError::CredentialExpired {
            subscription_id: id.clone(),
            provider: subscription.provider_id.clone(),
            reason: reason.to_string(),
        };

        for _ in 0..=self.conflict_retries {
            let Some(current) = self.store.get_credential(id).await? else {
                return Err(expired("no credential stored"));
            };
            let fresh_until = Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS);
            if current.expires_at.is_none_or(|at| at > fresh_until) {
                return Ok(current.access_token);
            }
            let Some(refresh_token) = current.refresh_token.clone() else {
                return Err(expired("access token expired and no refresh token is stored"));
            };

            let oauth = config
                .oauth
                .as_ref()
                .ok_or_else(|| EngineError::InvalidConfig(format!("subscription {id} has no oauth client configured")))?;
            let token_url = oauth
                .token_url
                .as_deref()
                .or(token_endpoint)
                .ok_or_else(|| EngineError::InvalidConfig(format!("no token endpoint for {}", subscription.provider_id)))?;
            let client = OAuthClient {
                client_id: self.secrets.require(&oauth.client_id).await?,
                client_secret: self.secrets.require(&oauth.client_secret).await?,
            };

            debug!(subscription_id = %id, "refreshing access token");
            let grant = self
                .policy
                .run(id, || refresh_access_token(&self.http, token_url, &client, &refresh_token))
                .await
                .map_err(|e| EngineError::from_provider(e, id, &subscription.provider_id))?;

            let next = StoredCredential {
                subscription_id: id.clone(),
                access_token: grant.access_token,
                refresh_token: grant.refresh_token.or(current.refresh_token),
                expires_at: grant.expires_at,
                version: current.version,
            };
            match self.store.swap_credential(current.version, &next).await {
                Ok(stored) => {
                    info!(subscription_id = %id, version = stored.version, "access token refreshed");
                    return Ok(stored.access_token);
                }
                Err(EngineError::VersionConflict(_)) => {
                    warn!(subscription_id = %id, "concurrent token refresh, re-reading");
                }
                Err(other) => return Err(other),
            }
        }
        Err(EngineError::VersionConflict(format!("credential for {id}")))
    }

    /// Context for one provider call. Providers without an OAuth endpoint may run
    /// with no stored credential at all.
    pub async fn call_context(
        &self,
        subscription: &Subscription,
        config: &SubscriptionConfig,
        provider: &dyn Provider,
    ) -> Result<CallContext, EngineError> {
        let bearer = match provider.token_endpoint() {
            None if self.store.get_credential(&subscription.subscription_id).await?.is_none() => String::new(),
            endpoint => self.get_valid_token(subscription, config, endpoint).await?,
        };
        Ok(CallContext::new(self.http.clone(), bearer))
    }
}

/// Constant-time check of a presented token against the subscription's secret.
pub fn validate_static_secret(subscription: &Subscription, presented: &str) -> Result<(), EngineError> {
    if constant_time_eq(presented, &subscription.verification_secret) {
        Ok(())
    } else {
        Err(EngineError::AuthenticationFailed("verification token mismatch".into()))
    }
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::MapSecretsManager;
    use crate::store::{CredentialStore, MemoryStore};
    use httpmock::prelude::*;
    use serde_json::json;
    use trigger_plugin::message::{ResourceScope, SubscriptionStatus};

    fn subscription() -> Subscription {
        Subscription {
            subscription_id: "s1".to_string(),
            provider_id: "gmail".to_string(),
            resource_scope: ResourceScope::new("me"),
            callback_url: "https://hooks.example.com/cb".to_string(),
            external_channel_id: None,
            external_resource_id: None,
            expires_at: None,
            renewed_at: Utc::now(),
            verification_secret: "tok-123".to_string(),
            status: SubscriptionStatus::Active,
            properties: Default::default(),
            version: 0,
        }
    }

    fn config(token_url: &str) -> SubscriptionConfig {
        SubscriptionConfig::from_yaml(&format!(
            r#"
provider: gmail
scope: {{ resource: me }}
callback_url: https://hooks.example.com/cb
oauth: {{ client_id: CID, client_secret: CSECRET, token_url: "{token_url}" }}
authenticity: {{ mode: shared_token, location: {{ in: header, name: X-Token }} }}
"#
        ))
        .unwrap()
    }

    fn manager(store: Arc<MemoryStore>) -> CredentialManager {
        let secrets = SecretsManager(MapSecretsManager::new().with("CID", "id").with("CSECRET", "secret"));
        CredentialManager::new(
            store,
            secrets,
            reqwest::Client::new(),
            RetryPolicy::once(std::time::Duration::from_secs(5)),
            2,
        )
    }

    #[tokio::test]
    async fn valid_tokens_are_returned_without_refresh() {
        let store = MemoryStore::new();
        store
            .put_credential(&StoredCredential {
                subscription_id: "s1".into(),
                access_token: "live".into(),
                refresh_token: Some("r".into()),
                expires_at: Some(Utc::now() + Duration::hours(1)),
                version: 0,
            })
            .await
            .unwrap();
        let token = manager(store).get_valid_token(&subscription(), &config("http://unused"), None).await.unwrap();
        assert_eq!(token, "live");
    }

    #[tokio::test]
    async fn expired_tokens_are_refreshed_and_persisted() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body(json!({"access_token": "fresh", "expires_in": 3600}));
        });
        let store = MemoryStore::new();
        store
            .put_credential(&StoredCredential {
                subscription_id: "s1".into(),
                access_token: "stale".into(),
                refresh_token: Some("r".into()),
                expires_at: Some(Utc::now() - Duration::minutes(5)),
                version: 0,
            })
            .await
            .unwrap();

        let mgr = manager(store.clone());
        let token = mgr.get_valid_token(&subscription(), &config(&server.url("/token")), None).await.unwrap();
        assert_eq!(token, "fresh");
        mock.assert();

        let stored = store.get_credential("s1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh");
        assert_eq!(stored.refresh_token.as_deref(), Some("r"));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn revoked_refresh_tokens_surface_as_credential_expired() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).json_body(json!({"error": "invalid_grant"}));
        });
        let store = MemoryStore::new();
        store
            .put_credential(&StoredCredential {
                subscription_id: "s1".into(),
                access_token: "stale".into(),
                refresh_token: Some("r".into()),
                expires_at: Some(Utc::now() - Duration::minutes(5)),
                version: 0,
            })
            .await
            .unwrap();
        let err = manager(store)
            .get_valid_token(&subscription(), &config(&server.url("/token")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CredentialExpired { .. }));
        assert!(err.user_message().contains("Re-authorize gmail"));
    }

    #[tokio::test]
    async fn missing_credentials_ask_for_authorization() {
        let err = manager(MemoryStore::new())
            .get_valid_token(&subscription(), &config("http://unused"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CredentialExpired { .. }));
    }

    #[tokio::test]
    async fn a_losing_refresh_uses_the_winners_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .delay(std::time::Duration::from_millis(300))
                    .json_body(json!({"access_token": "mine", "expires_in": 3600}));
            })
            .await;
        let store = MemoryStore::new();
        let seeded = store
            .put_credential(&StoredCredential {
                subscription_id: "s1".into(),
                access_token: "stale".into(),
                refresh_token: Some("r".into()),
                expires_at: Some(Utc::now() - Duration::minutes(5)),
                version: 0,
            })
            .await
            .unwrap();

        let mgr = manager(store.clone());
        let config = config(&server.url("/token"));
        let competing = async {
            // lands while this manager's refresh is still in flight
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let winner = StoredCredential {
                access_token: "theirs".into(),
                expires_at: Some(Utc::now() + Duration::hours(1)),
                ..seeded.clone()
            };
            store.swap_credential(seeded.version, &winner).await.unwrap()
        };
        let sub = subscription();
        let (token, won) = tokio::join!(mgr.get_valid_token(&sub, &config, None), competing);

        assert_eq!(token.unwrap(), "theirs");
        mock.assert_async().await;
        let stored = store.get_credential("s1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "theirs");
        assert_eq!(stored.version, won.version);
        assert_eq!(stored.version, seeded.version + 1);
    }

    #[test]
    fn static_secret_comparison() {
        assert!(validate_static_secret(&subscription(), "tok-123").is_ok());
        assert!(matches!(
            validate_static_secret(&subscription(), "tok-124"),
            Err(EngineError::AuthenticationFailed(_))
        ));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
