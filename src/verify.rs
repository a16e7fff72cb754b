use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, error, warn};
use trigger_plugin::message::{Delivery, Subscription};

use crate::credential::{constant_time_eq, validate_static_secret};
use crate::secret::SecretsManager;
use crate::subscription_config::{
    AuthMode, Handshake, OidcKey, SignatureEncoding, SubscriptionConfig, TimestampScheme, TokenLocation, lookup,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Authentic,
    Rejected(String),
}

impl Verdict {
    fn reject(reason: impl Into<String>) -> Self {
        Verdict::Rejected(reason.into())
    }
}

#[derive(Debug, Deserialize)]
struct PushClaims {
    email: Option<String>,
    email_verified: Option<bool>,
}

/// Decides whether a delivery really comes from the provider. Fails closed: any
/// missing header, claim, key or secret is a rejection.
pub struct Verifier {
    secrets: SecretsManager,
    http: reqwest::Client,
    jwks: Cache<String, Arc<JwkSet>>,
}

impl Verifier {
    pub fn new(secrets: SecretsManager, http: reqwest::Client) -> Self {
        let jwks = Cache::builder().max_capacity(32).time_to_live(Duration::from_secs(3_600)).build();
        Self { secrets, http, jwks }
    }

    /// The body is treated as opaque bytes throughout, except for the body-field token mode.
    pub async fn verify(&self, subscription: &Subscription, config: &SubscriptionConfig, delivery: &Delivery) -> Verdict {
        let verdict = match &config.authenticity {
            AuthMode::Hmac { secret, header, prefix, timestamp, encoding } => {
                match self.secrets.get_secret(secret).await {
                    Ok(Some(key)) => verify_hmac(&key, header, prefix.as_deref(), timestamp.as_ref(), *encoding, delivery),
                    Ok(None) => {
                        error!(secret = %secret, "hmac signing secret is not set");
                        Verdict::reject("signing secret unavailable")
                    }
                    Err(e) => {
                        error!(secret = %secret, "reading signing secret failed: {e}");
                        Verdict::reject("signing secret unavailable")
                    }
                }
            }
            AuthMode::Oidc { issuers, service_account, key } => {
                self.verify_oidc(issuers, service_account, key, &subscription.callback_url, delivery).await
            }
            AuthMode::SharedToken { location } => verify_shared_token(location, subscription, delivery),
        };
        if let Verdict::Rejected(reason) = &verdict {
            warn!(subscription_id = %subscription.subscription_id, reason = %reason, "delivery rejected");
        }
        verdict
    }

    async fn verify_oidc(
        &self,
        issuers: &[String],
        service_account: &str,
        key: &OidcKey,
        audience: &str,
        delivery: &Delivery,
    ) -> Verdict {
        let Some(token) = delivery
            .header("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        else {
            return Verdict::reject("missing bearer token");
        };
        let Ok(header) = decode_header(token) else {
            return Verdict::reject("malformed bearer token");
        };

        let (decoding_key, algorithm) = match key {
            OidcKey::SharedSecret { name } => match self.secrets.get_secret(name).await {
                Ok(Some(secret)) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
                _ => return Verdict::reject("token signing secret unavailable"),
            },
            OidcKey::Jwks { url } => {
                let Some(kid) = header.kid.as_deref() else {
                    return Verdict::reject("token header has no kid");
                };
                let set = match self.fetch_jwks(url).await {
                    Ok(set) => set,
                    Err(e) => {
                        warn!(url = %url, "fetching signing keys failed: {e}");
                        return Verdict::reject("signing keys unavailable");
                    }
                };
                let Some(jwk) = set.find(kid) else {
                    return Verdict::reject(format!("unknown signing key {kid}"));
                };
                match DecodingKey::from_jwk(jwk) {
                    Ok(k) => (k, Algorithm::RS256),
                    Err(e) => return Verdict::reject(format!("unusable signing key: {e}")),
                }
            }
        };
        if header.alg != algorithm {
            return Verdict::reject(format!("unexpected token algorithm {:?}", header.alg));
        }

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(issuers);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let claims = match decode::<PushClaims>(token, &decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(e) => return Verdict::reject(format!("token rejected: {e}")),
        };
        if claims.email_verified == Some(false) {
            return Verdict::reject("signer email is not verified");
        }
        match claims.email {
            Some(email) if email == service_account => Verdict::Authentic,
            Some(email) => Verdict::reject(format!("unexpected signer {email}")),
            None => Verdict::reject("token has no signer email"),
        }
    }

    async fn fetch_jwks(&self, url: &str) -> Result<Arc<JwkSet>, Arc<reqwest::Error>> {
        self.jwks
            .try_get_with(url.to_string(), async {
                debug!(url, "fetching signing keys");
                let set = self.http.get(url).send().await?.error_for_status()?.json::<JwkSet>().await?;
                Ok::<_, reqwest::Error>(Arc::new(set))
            })
            .await
    }
}

fn verify_hmac(
    key: &str,
    header: &str,
    prefix: Option<&str>,
    timestamp: Option<&TimestampScheme>,
    encoding: SignatureEncoding,
    delivery: &Delivery,
) -> Verdict {
    let Some(presented) = delivery.header(header) else {
        return Verdict::reject(format!("missing {header} header"));
    };
    let presented = match prefix {
        Some(p) => match presented.strip_prefix(p) {
            Some(rest) => rest,
            None => return Verdict::reject(format!("{header} lacks the {p} prefix")),
        },
        None => presented,
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key.as_bytes()) else {
        return Verdict::reject("unusable signing secret");
    };
    if let Some(scheme) = timestamp {
        let Some(raw_ts) = delivery.header(&scheme.header) else {
            return Verdict::reject(format!("missing {} header", scheme.header));
        };
        let Ok(ts) = raw_ts.parse::<i64>() else {
            return Verdict::reject("malformed request timestamp");
        };
        if Utc::now().timestamp().abs_diff(ts) > scheme.tolerance_secs.unsigned_abs() {
            return Verdict::reject("request timestamp outside the replay window");
        }
        mac.update(format!("{}:{}:", scheme.version, raw_ts).as_bytes());
    }
    mac.update(&delivery.body);
    let digest = mac.finalize().into_bytes();

    let matches = match encoding {
        SignatureEncoding::Hex => constant_time_eq(&presented.to_ascii_lowercase(), &hex::encode(digest)),
        SignatureEncoding::Base64 => constant_time_eq(presented, &STANDARD.encode(digest)),
    };
    if matches { Verdict::Authentic } else { Verdict::reject("signature mismatch") }
}

fn verify_shared_token(location: &TokenLocation, subscription: &Subscription, delivery: &Delivery) -> Verdict {
    let presented = match location {
        TokenLocation::Header { name } => delivery.header(name).map(str::to_string),
        TokenLocation::Query { name } => delivery.query_param(name).map(str::to_string),
        TokenLocation::BodyField { path } => serde_json::from_slice::<Value>(&delivery.body)
            .ok()
            .and_then(|body| lookup(&body, path).and_then(Value::as_str).map(str::to_string)),
    };
    match presented.map(|token| validate_static_secret(subscription, &token)) {
        Some(Ok(())) => Verdict::Authentic,
        Some(Err(_)) => Verdict::reject("verification token mismatch"),
        None => Verdict::reject("verification token missing"),
    }
}

/// A registration challenge carried in the query string, answered before any
/// signature check. `None` when the delivery is not such a challenge.
pub fn query_handshake(subscription: &Subscription, config: &SubscriptionConfig, delivery: &Delivery) -> Option<Result<String, String>> {
    let Some(Handshake::QueryEcho { challenge_param, token_param, mode_param, expected_mode }) = &config.handshake else {
        return None;
    };
    let challenge = delivery.query_param(challenge_param)?;

    if let (Some(param), Some(expected)) = (mode_param, expected_mode)
        && delivery.query_param(param) != Some(expected.as_str())
    {
        return Some(Err(format!("handshake mode is not {expected}")));
    }
    if let Some(param) = token_param {
        let presented = delivery.query_param(param).unwrap_or_default();
        if validate_static_secret(subscription, presented).is_err() {
            return Some(Err("handshake token mismatch".into()));
        }
    }
    Some(Ok(challenge.to_string()))
}

/// A challenge inside an already-verified JSON body (Slack `url_verification`).
pub fn body_handshake(config: &SubscriptionConfig, body: &[u8]) -> Option<String> {
    let Some(Handshake::BodyChallenge { type_field, type_value, challenge_field }) = &config.handshake else {
        return None;
    };
    let value: Value = serde_json::from_slice(body).ok()?;
    if value.get(type_field).and_then(Value::as_str) != Some(type_value.as_str()) {
        return None;
    }
    value.get(challenge_field).and_then(Value::as_str).map(str::to_string)
}
