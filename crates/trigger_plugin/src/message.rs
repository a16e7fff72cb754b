use std::{cmp::Ordering, collections::{BTreeMap, HashMap}};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Where a provider-side registration is in its life.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Pending,
    Active,
    Expiring,
    Revoked,
}

impl SubscriptionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expiring => "expiring",
            Self::Revoked => "revoked",
        }
    }

    /// Active and expiring channels are both still delivering.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Expiring)
    }
}

/// What is being watched: a mailbox, a drive, a phone number, a channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct ResourceScope {
    pub resource: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl ResourceScope {
    pub fn new(resource: impl Into<String>) -> Self {
        Self { resource: resource.into(), params: BTreeMap::new() }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Stable identity used to enforce one live channel per (provider, scope).
    pub fn key(&self) -> String {
        let params = Value::Object(
            self.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        format!("{}|{}", self.resource, canonical_json(&params))
    }
}

/// Opaque provider ordering token (history id, page token, ...).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Cursor(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric cursors compare numerically; opaque ones are unordered.
    pub fn compare(&self, other: &Cursor) -> Option<Ordering> {
        if self.0 == other.0 {
            return Some(Ordering::Equal);
        }
        match (self.0.parse::<u128>(), other.0.parse::<u128>()) {
            (Ok(a), Ok(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }

    /// True only when both cursors are ordered and `self` sits before `other`.
    pub fn is_behind(&self, other: &Cursor) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }

    /// True when `self` is known to cover everything up to `other`.
    pub fn covers(&self, other: &Cursor) -> bool {
        matches!(self.compare(other), Some(Ordering::Equal | Ordering::Greater))
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One active watch/registration with a provider.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Subscription {
    pub subscription_id: String,
    pub provider_id: String,
    pub resource_scope: ResourceScope,
    pub callback_url: String,
    pub external_channel_id: Option<String>,
    /// Some providers need a second handle to tear a channel down (Drive resourceId).
    pub external_resource_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Start of the current validity period, used to size the renewal window.
    pub renewed_at: DateTime<Utc>,
    pub verification_secret: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub version: u64,
}

impl Subscription {
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// Durable cursor for one subscription's change feed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Checkpoint {
    pub subscription_id: String,
    pub cursor: Cursor,
    pub updated_at: DateTime<Utc>,
    pub last_reset_at: Option<DateTime<Utc>>,
}

/// A raw change exactly as the provider feed shaped it, before classification.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RawChange {
    pub kind: String,
    pub sequence_hint: Option<String>,
    pub body: Value,
}

impl RawChange {
    pub fn new(kind: impl Into<String>, sequence_hint: Option<String>, body: Value) -> Self {
        Self { kind: kind.into(), sequence_hint, body }
    }
}

/// One page of a provider change feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ChangePage {
    pub changes: Vec<RawChange>,
    pub next_page_token: Option<String>,
    /// The cursor to commit once every page has been drained.
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChangeRecord {
    pub change_id: String,
    pub family: String,
    pub payload: Value,
    pub sequence_hint: Option<String>,
}

impl ChangeRecord {
    /// Identity derived from stable fields when the provider has none of its own.
    pub fn derived_id(family: &str, stable_fields: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(family.as_bytes());
        for field in stable_fields {
            hasher.update([0u8]);
            hasher.update(field.as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Flat host-facing value. Composites never cross this boundary as containers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum VariableValue {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl VariableValue {
    pub fn as_str(&self) -> Option<&str> {
        if let VariableValue::String(s) = self { Some(s) } else { None }
    }

    pub fn as_i64(&self) -> Option<i64> {
        if let VariableValue::Integer(n) = self { Some(*n) } else { None }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let VariableValue::Boolean(b) = self { Some(*b) } else { None }
    }

    /// Arrays, objects and nulls become canonical JSON strings.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => VariableValue::String(s.clone()),
            Value::Bool(b) => VariableValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => VariableValue::Integer(i),
                None => VariableValue::Number(n.as_f64().unwrap_or_default()),
            },
            other => VariableValue::String(canonical_json(other)),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::String(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Integer(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        VariableValue::Boolean(value)
    }
}

/// The externally visible unit handed to the host platform.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatchedEvent {
    pub event_type: String,
    pub variables: BTreeMap<String, VariableValue>,
    pub dedupe_key: String,
    pub subscription_id: String,
    pub source_change_id: String,
}

/// An inbound POST-shaped delivery. The body stays opaque bytes until verified.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delivery {
    pub method: String,
    headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn post(body: impl Into<Vec<u8>>) -> Self {
        Self { method: "POST".to_string(), body: body.into(), ..Default::default() }
    }

    pub fn get() -> Self {
        Self { method: "GET".to_string(), ..Default::default() }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    pub fn from_parts(
        method: &str,
        headers: HashMap<String, String>,
        query: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self { method: method.to_ascii_uppercase(), headers, query, body }
    }

    /// Header lookup is case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// What a verified delivery says about the feed. Advisory only.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryHint {
    /// Provider-side keepalive or channel sync; nothing changed.
    Sync,
    Changed { cursor: Option<Cursor> },
}

/// Result of a provider subscribe or renew call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelGrant {
    pub external_channel_id: Option<String>,
    pub external_resource_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub baseline: Option<Cursor>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Serialise JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

// serde_json may preserve insertion order, so keys are written explicitly.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_cursors_order_numerically() {
        let a = Cursor::new("99");
        let b = Cursor::new("100");
        assert!(a.is_behind(&b));
        assert!(b.covers(&a));
        assert!(!b.is_behind(&a));
    }

    #[test]
    fn opaque_cursors_are_unordered() {
        let a = Cursor::new("CAESBggDEAEYAQ");
        let b = Cursor::new("CAESBggDEAEYAg");
        assert_eq!(a.compare(&b), None);
        assert!(!a.is_behind(&b));
        assert!(a.covers(&a.clone()));
    }

    #[test]
    fn composite_variables_become_canonical_strings() {
        let value = json!({"b": [1, 2], "a": {"z": true, "y": null}});
        let flat = VariableValue::from_json(&value);
        assert_eq!(
            flat,
            VariableValue::String(r#"{"a":{"y":null,"z":true},"b":[1,2]}"#.to_string())
        );
        assert_eq!(VariableValue::from_json(&json!(42)), VariableValue::Integer(42));
        assert_eq!(VariableValue::from_json(&json!(1.5)), VariableValue::Number(1.5));
        assert_eq!(VariableValue::from_json(&json!(false)), VariableValue::Boolean(false));
    }

    #[test]
    fn scope_key_ignores_param_insertion_order() {
        let a = ResourceScope::new("me")
            .with_param("topic", json!("t"))
            .with_param("labels", json!(["INBOX"]));
        let b = ResourceScope::new("me")
            .with_param("labels", json!(["INBOX"]))
            .with_param("topic", json!("t"));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn delivery_headers_are_case_insensitive() {
        let delivery = Delivery::post("{}").with_header("X-Hub-Signature-256", "sha256=ab");
        assert_eq!(delivery.header("x-hub-signature-256"), Some("sha256=ab"));
        assert_eq!(delivery.header("X-HUB-SIGNATURE-256"), Some("sha256=ab"));
    }

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let a = ChangeRecord::derived_id("label-added", &["m1", "INBOX"]);
        let b = ChangeRecord::derived_id("label-added", &["m1", "INBOX"]);
        let c = ChangeRecord::derived_id("label-added", &["m1INBOX"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
