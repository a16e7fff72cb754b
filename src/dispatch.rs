use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use trigger_plugin::message::{ChangeRecord, Cursor, DispatchedEvent, Subscription, VariableValue};

use crate::logger::EngineMetrics;
use crate::store::Store;
use crate::subscription_config::{EventDeclaration, EventFilter, FieldSource, SubscriptionConfig, lookup};

pub const GAP_EVENT: &str = "subscription_gap";

/// Stable across processes: sha256 over the NUL-joined identity triple.
pub fn dedupe_key(subscription_id: &str, change_id: &str, event_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subscription_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(change_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(event_type.as_bytes());
    hex::encode(hasher.finalize())
}

/// Maps classified changes onto declared event types and collapses repeats.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    retention: Duration,
    metrics: EngineMetrics,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, retention: Duration, metrics: EngineMetrics) -> Self {
        Self { store, retention, metrics }
    }

    /// Events for `records` in feed order, declaration order within one record.
    /// `cursor` is the checkpoint the records were committed under.
    pub async fn dispatch(
        &self,
        subscription: &Subscription,
        config: &SubscriptionConfig,
        cursor: &Cursor,
        records: &[ChangeRecord],
    ) -> Vec<DispatchedEvent> {
        let mut events = Vec::new();
        for record in records {
            for declaration in config.declarations_for(&record.family) {
                if let Some(failed) = declaration.filters.iter().find(|f| !passes(f, &record.payload)) {
                    debug!(
                        subscription_id = %subscription.subscription_id,
                        change_id = %record.change_id,
                        event_type = %declaration.event_type,
                        filter = ?failed,
                        "filtered out"
                    );
                    continue;
                }
                let event = DispatchedEvent {
                    event_type: declaration.event_type.clone(),
                    variables: variables(declaration, record, subscription, cursor),
                    dedupe_key: dedupe_key(&subscription.subscription_id, &record.change_id, &declaration.event_type),
                    subscription_id: subscription.subscription_id.clone(),
                    source_change_id: record.change_id.clone(),
                };
                if self.admit(&event).await {
                    events.push(event);
                }
            }
        }
        if !events.is_empty() {
            self.metrics.events_dispatched.add(events.len() as u64, &[]);
        }
        events
    }

    /// The informational event surfaced after a checkpoint reset.
    pub async fn gap(&self, subscription: &Subscription, previous: &Cursor, baseline: &Cursor) -> Option<DispatchedEvent> {
        self.metrics.gaps_detected.add(1, &[]);
        let variables = BTreeMap::from([
            ("previous_cursor".to_string(), VariableValue::from(previous.as_str())),
            ("new_cursor".to_string(), VariableValue::from(baseline.as_str())),
            ("subscription_id".to_string(), VariableValue::from(subscription.subscription_id.as_str())),
            ("detected_at".to_string(), VariableValue::from(Utc::now().to_rfc3339())),
        ]);
        let change_id = format!("gap:{previous}:{baseline}");
        let event = DispatchedEvent {
            event_type: GAP_EVENT.to_string(),
            variables,
            dedupe_key: dedupe_key(&subscription.subscription_id, &change_id, GAP_EVENT),
            subscription_id: subscription.subscription_id.clone(),
            source_change_id: change_id,
        };
        if self.admit(&event).await {
            self.metrics.events_dispatched.add(1, &[]);
            Some(event)
        } else {
            None
        }
    }

    /// A ledger outage lets the event through; a duplicate beats a silent loss.
    async fn admit(&self, event: &DispatchedEvent) -> bool {
        match self.store.record_if_new(&event.dedupe_key, self.retention).await {
            Ok(fresh) => {
                if !fresh {
                    debug!(subscription_id = %event.subscription_id, key = %event.dedupe_key, "duplicate suppressed");
                }
                fresh
            }
            Err(e) => {
                warn!(subscription_id = %event.subscription_id, error = %e, "dedupe ledger unavailable, emitting anyway");
                true
            }
        }
    }
}

fn variables(
    declaration: &EventDeclaration,
    record: &ChangeRecord,
    subscription: &Subscription,
    cursor: &Cursor,
) -> BTreeMap<String, VariableValue> {
    if declaration.fields.is_empty() {
        let mut out: BTreeMap<String, VariableValue> = match &record.payload {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), VariableValue::from_json(v))).collect(),
            other => BTreeMap::from([("payload".to_string(), VariableValue::from_json(other))]),
        };
        out.insert("change_id".to_string(), VariableValue::from(record.change_id.as_str()));
        out.insert("family".to_string(), VariableValue::from(record.family.as_str()));
        return out;
    }

    let mut out = BTreeMap::new();
    for field in &declaration.fields {
        let value = match &field.source {
            FieldSource::Payload { path } => lookup(&record.payload, path).filter(|v| !v.is_null()).map(VariableValue::from_json),
            FieldSource::Cursor => Some(cursor_value(cursor)),
            FieldSource::ChangeId => Some(VariableValue::from(record.change_id.as_str())),
            FieldSource::Family => Some(VariableValue::from(record.family.as_str())),
            FieldSource::SubscriptionId => Some(VariableValue::from(subscription.subscription_id.as_str())),
            FieldSource::SequenceHint => record.sequence_hint.as_deref().map(VariableValue::from),
            FieldSource::Constant { value } => Some(VariableValue::from_json(value)),
        };
        if let Some(value) = value.or_else(|| field.default.as_ref().map(VariableValue::from_json)) {
            out.insert(field.name.clone(), value);
        }
    }
    out
}

/// Numeric cursors stay numbers for the host.
fn cursor_value(cursor: &Cursor) -> VariableValue {
    match cursor.as_str().parse::<i64>() {
        Ok(n) => VariableValue::Integer(n),
        Err(_) => VariableValue::from(cursor.as_str()),
    }
}

pub fn passes(filter: &EventFilter, payload: &Value) -> bool {
    match filter {
        EventFilter::Keyword { field, any_of } => {
            let Some(text) = lookup(payload, field).and_then(text_of) else {
                return false;
            };
            let text = text.to_lowercase();
            any_of.iter().any(|k| text.contains(&k.to_lowercase()))
        }
        EventFilter::Sender { field, allow } => {
            let Some(raw) = lookup(payload, field).and_then(Value::as_str) else {
                return false;
            };
            let address = sender_address(raw);
            allow.iter().any(|entry| {
                let entry = entry.to_lowercase();
                if entry.starts_with('@') { address.ends_with(&entry) } else { address == entry }
            })
        }
        EventFilter::Threshold { field, min, max } => {
            let Some(n) = lookup(payload, field).and_then(number_of) else {
                return false;
            };
            min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m)
        }
        EventFilter::LabelAnyOf { field, labels } => match lookup(payload, field) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).any(|l| labels.iter().any(|x| x == l)),
            Some(Value::String(single)) => labels.iter().any(|x| x == single),
            _ => false,
        },
        EventFilter::Equals { field, value } => lookup(payload, field) == Some(value),
        EventFilter::Matches { field, pattern } => {
            let Some(text) = lookup(payload, field).and_then(text_of) else {
                return false;
            };
            Regex::new(pattern).is_ok_and(|re| re.is_match(&text))
        }
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `"Ann <ann@x.com>"` and `"ann@x.com"` both yield `ann@x.com`.
fn sender_address(raw: &str) -> String {
    let inner = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    inner.trim().to_lowercase()
}
