//! Per-subscription configuration, declared in YAML by whoever sets the trigger up.
//!
//! Only secret *names* appear here; values are resolved through the `SecretsManager`
//! at the moment they are needed.

use std::path::Path;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trigger_plugin::message::{ResourceScope, Subscription};
use url::Url;

use crate::error::EngineError;

/// Key under which the config is stored in `Subscription::properties`.
pub const CONFIG_PROPERTY: &str = "config";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SubscriptionConfig {
    pub provider: String,
    pub scope: ResourceScope,
    pub callback_url: String,
    #[serde(default)]
    pub oauth: Option<OAuthSecrets>,
    pub authenticity: AuthMode,
    #[serde(default)]
    pub handshake: Option<Handshake>,
    /// Header whose presence marks a provider redelivery of an in-flight notification.
    #[serde(default)]
    pub retry_header: Option<String>,
    /// Overrides the computed renewal window.
    #[serde(default)]
    pub renewal_window_secs: Option<u64>,
    #[serde(default)]
    pub events: Vec<EventDeclaration>,
}

/// Names of the secrets holding the OAuth client registration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OAuthSecrets {
    pub client_id: String,
    pub client_secret: String,
    /// Defaults to the provider's own token endpoint.
    #[serde(default)]
    pub token_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// Signature over the raw body (optionally prefixed with a timestamp).
    Hmac {
        secret: String,
        header: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        timestamp: Option<TimestampScheme>,
        #[serde(default)]
        encoding: SignatureEncoding,
    },
    /// Bearer JWT from a push service (Pub/Sub push with an OIDC token).
    Oidc {
        #[serde(default = "default_issuers")]
        issuers: Vec<String>,
        /// Expected `email` claim of the signing service account.
        service_account: String,
        key: OidcKey,
    },
    /// A static token the provider echoes back on every delivery.
    SharedToken { location: TokenLocation },
}

/// Slack-style `v0:{timestamp}:{body}` signing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TimestampScheme {
    pub header: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_tolerance")]
    pub tolerance_secs: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OidcKey {
    Jwks { url: String },
    /// HS256 secret, for push services that sign with a shared key.
    SharedSecret { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "in", rename_all = "snake_case")]
pub enum TokenLocation {
    Header { name: String },
    Query { name: String },
    /// Dot-separated path into a JSON body.
    BodyField { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Handshake {
    /// Challenge in the query string, echoed as the response body.
    QueryEcho {
        challenge_param: String,
        #[serde(default)]
        token_param: Option<String>,
        #[serde(default)]
        mode_param: Option<String>,
        #[serde(default)]
        expected_mode: Option<String>,
    },
    /// Challenge inside an authenticated JSON body.
    BodyChallenge {
        #[serde(default = "default_type_field")]
        type_field: String,
        #[serde(default = "default_type_value")]
        type_value: String,
        #[serde(default = "default_challenge_field")]
        challenge_field: String,
    },
}

/// Maps change families onto one event type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EventDeclaration {
    pub event_type: String,
    pub families: Vec<String>,
    /// When empty, every top-level payload field is emitted as-is.
    #[serde(default)]
    pub fields: Vec<OutputField>,
    #[serde(default)]
    pub filters: Vec<EventFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OutputField {
    pub name: String,
    pub source: FieldSource,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum FieldSource {
    Payload { path: String },
    /// The cursor committed by the pass that produced the change.
    Cursor,
    ChangeId,
    Family,
    SubscriptionId,
    SequenceHint,
    Constant { value: Value },
}

/// Filters are ANDed; a change failing any of them is dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum EventFilter {
    /// Case-insensitive substring match against any of the keywords.
    Keyword { field: String, any_of: Vec<String> },
    /// Address or `@domain` allow-list.
    Sender { field: String, allow: Vec<String> },
    Threshold {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    LabelAnyOf { field: String, labels: Vec<String> },
    Equals { field: String, value: Value },
    Matches { field: String, pattern: String },
}

fn default_issuers() -> Vec<String> {
    vec!["https://accounts.google.com".to_string(), "accounts.google.com".to_string()]
}

fn default_version() -> String {
    "v0".to_string()
}

fn default_tolerance() -> i64 {
    300
}

fn default_type_field() -> String {
    "type".to_string()
}

fn default_type_value() -> String {
    "url_verification".to_string()
}

fn default_challenge_field() -> String {
    "challenge".to_string()
}

impl SubscriptionConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, EngineError> {
        let config: SubscriptionConfig = serde_yaml_bw::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// The config a subscription was provisioned with.
    pub fn of(subscription: &Subscription) -> Result<Self, EngineError> {
        let value = subscription.properties.get(CONFIG_PROPERTY).ok_or_else(|| {
            EngineError::InvalidConfig(format!("subscription {} has no stored config", subscription.subscription_id))
        })?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value, EngineError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        if self.provider.trim().is_empty() {
            return invalid("provider is required".into());
        }
        let url = Url::parse(&self.callback_url)
            .map_err(|e| EngineError::InvalidConfig(format!("callback_url {}: {e}", self.callback_url)))?;
        let local = matches!(url.host_str(), Some("localhost" | "127.0.0.1"));
        if url.scheme() != "https" && !local {
            return invalid(format!("callback_url {} must use https", self.callback_url));
        }

        match &self.authenticity {
            AuthMode::Hmac { secret, header, timestamp, .. } => {
                if secret.is_empty() || header.is_empty() {
                    return invalid("hmac mode needs both secret and header".into());
                }
                if let Some(ts) = timestamp
                    && ts.tolerance_secs <= 0
                {
                    return invalid("timestamp tolerance must be positive".into());
                }
            }
            AuthMode::Oidc { issuers, service_account, .. } => {
                if issuers.is_empty() || service_account.is_empty() {
                    return invalid("oidc mode needs issuers and service_account".into());
                }
            }
            AuthMode::SharedToken { .. } => {}
        }

        for event in &self.events {
            if event.event_type.is_empty() || event.families.is_empty() {
                return invalid(format!("event {:?} needs a type and at least one family", event.event_type));
            }
            for filter in &event.filters {
                if let EventFilter::Matches { pattern, .. } = filter {
                    Regex::new(pattern)
                        .map_err(|e| EngineError::InvalidConfig(format!("filter pattern {pattern}: {e}")))?;
                }
                if let EventFilter::Threshold { min: None, max: None, .. } = filter {
                    return invalid(format!("threshold filter on {} has no bound", event.event_type));
                }
            }
        }
        Ok(())
    }

    /// Declarations whose families include `family`, in declaration order.
    pub fn declarations_for<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a EventDeclaration> + 'a {
        self.events.iter().filter(move |e| e.families.iter().any(|f| f == family))
    }
}

/// Resolves a dot-separated path (`a.b.0.c`) inside a JSON value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
