//! Gmail mailbox changes via `users.watch` and Pub/Sub push.
//!
//! Gmail only pushes "mailbox X is now at history id N". The actual delta comes
//! from `users.history.list`, which this provider pages through on behalf of the
//! reconciler.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use trigger_plugin::{
    message::{ChangePage, ChangeRecord, ChannelGrant, Cursor, Delivery, DeliveryHint, RawChange, Subscription},
    oauth::GOOGLE_TOKEN_URL,
    plugin::{CallContext, ClassifyFn, Provider, ProviderError, RenewalMode, SubscribeRequest},
    plugin_helpers::{millis_field, send_empty, send_json, string_field},
};

pub const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1";
pub const PROVIDER_ID: &str = "gmail";

/// Gmail does not always report an expiration; watches last about a week.
const DEFAULT_WATCH_DAYS: i64 = 6;

pub struct GmailProvider {
    base_url: String,
}

impl Default for GmailProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailProvider {
    pub fn new() -> Self {
        Self { base_url: GMAIL_API.to_string() }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    fn user_url(&self, user: &str, tail: &str) -> String {
        format!("{}/users/{}/{}", self.base_url, user, tail)
    }

    /// `me` unless the scope names a delegated mailbox.
    fn user(subscription_resource: &str) -> &str {
        if subscription_resource.is_empty() { "me" } else { subscription_resource }
    }

    async fn watch(&self, ctx: &CallContext, resource: &str, params: &serde_json::Map<String, Value>) -> Result<ChannelGrant, ProviderError> {
        let topic = params
            .get("topic_name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Rejected { status: 400, body: "topic_name is required".into() })?;

        let mut body = json!({ "topicName": topic });
        if let Some(labels) = params.get("label_ids").and_then(Value::as_array) {
            if !labels.is_empty() {
                body["labelIds"] = Value::Array(labels.clone());
            }
        }
        if let Some(action) = params.get("label_filter_action").and_then(Value::as_str) {
            if matches!(action, "include" | "exclude") {
                body["labelFilterAction"] = json!(action);
            }
        }

        let user = Self::user(resource);
        let response = send_json(ctx, ctx.http.post(self.user_url(user, "watch")).json(&body)).await?;
        let expires_at = millis_field(&response, "expiration")
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(|| Utc::now() + Duration::days(DEFAULT_WATCH_DAYS));

        info!(user, %expires_at, "gmail watch registered");
        Ok(ChannelGrant {
            external_channel_id: Some(format!("{PROVIDER_ID}:{user}")),
            external_resource_id: None,
            expires_at: Some(expires_at),
            baseline: string_field(&response, "historyId").map(Cursor::new),
            properties: Default::default(),
        })
    }
}

fn scope_params(subscription: &Subscription) -> serde_json::Map<String, Value> {
    subscription.resource_scope.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[async_trait]
impl Provider for GmailProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn renewal_mode(&self) -> RenewalMode {
        RenewalMode::ExtendInPlace
    }

    fn token_endpoint(&self) -> Option<&str> {
        Some(GOOGLE_TOKEN_URL)
    }

    async fn subscribe(&self, ctx: &CallContext, request: &SubscribeRequest) -> Result<ChannelGrant, ProviderError> {
        let params = request.scope.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.watch(ctx, &request.scope.resource, &params).await
    }

    async fn renew(&self, ctx: &CallContext, subscription: &Subscription, _channel_id: &str) -> Result<ChannelGrant, ProviderError> {
        // Re-issuing users.watch extends the existing watch.
        let mut grant = self.watch(ctx, &subscription.resource_scope.resource, &scope_params(subscription)).await?;
        grant.baseline = None;
        Ok(grant)
    }

    /// `users.stop` ends every watch on the mailbox, whatever the channel id.
    async fn unsubscribe(
        &self,
        ctx: &CallContext,
        subscription: &Subscription,
        _external_channel_id: Option<&str>,
        _external_resource_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let user = Self::user(&subscription.resource_scope.resource);
        send_empty(ctx, ctx.http.post(self.user_url(user, "stop"))).await
    }

    async fn baseline(&self, ctx: &CallContext, subscription: &Subscription) -> Result<Cursor, ProviderError> {
        let user = Self::user(&subscription.resource_scope.resource);
        let profile = send_json(ctx, ctx.http.get(self.user_url(user, "profile"))).await?;
        string_field(&profile, "historyId")
            .map(Cursor::new)
            .ok_or_else(|| ProviderError::Decode("profile without historyId".into()))
    }

    async fn list_changes(
        &self,
        ctx: &CallContext,
        subscription: &Subscription,
        cursor: &Cursor,
        page_token: Option<&str>,
    ) -> Result<ChangePage, ProviderError> {
        let user = Self::user(&subscription.resource_scope.resource);
        let mut query: Vec<(&str, &str)> = vec![("startHistoryId", cursor.as_str())];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let data = match send_json(ctx, ctx.http.get(self.user_url(user, "history")).query(&query)).await {
            Ok(data) => data,
            // history.list answers 404 once startHistoryId has aged out.
            Err(ProviderError::Rejected { status: 404, .. }) => {
                return Err(ProviderError::CursorExpired(cursor.to_string()));
            }
            Err(err) => return Err(err),
        };

        let page: HistoryPage = serde_json::from_value(data)?;
        let changes = page.history.iter().flat_map(HistoryEntry::raw_changes).collect::<Vec<_>>();
        debug!(user, changes = changes.len(), more = page.next_page_token.is_some(), "gmail history page");

        let cursor = match (&page.next_page_token, page.history_id) {
            (None, Some(Value::String(id))) => Some(Cursor::new(id)),
            (None, Some(Value::Number(id))) => Some(Cursor::new(id.to_string())),
            _ => None,
        };
        Ok(ChangePage { changes, next_page_token: page.next_page_token, cursor })
    }

    fn parse_hint(&self, _subscription: &Subscription, delivery: &Delivery) -> Result<DeliveryHint, ProviderError> {
        let notification = decode_push(&delivery.body)?;
        Ok(DeliveryHint::Changed { cursor: Some(Cursor::new(notification.history_id)) })
    }

    fn classifiers(&self) -> Vec<(&'static str, ClassifyFn)> {
        vec![
            ("messagesAdded", classify_message_added as ClassifyFn),
            ("messagesDeleted", classify_message_deleted),
            ("labelsAdded", classify_label_added),
            ("labelsRemoved", classify_label_removed),
        ]
    }

    /// History only carries ids; new messages get their headers, snippet and
    /// attachment list from `messages.get`.
    async fn enrich(&self, ctx: &CallContext, subscription: &Subscription, record: &ChangeRecord) -> Result<Option<Value>, ProviderError> {
        if record.family != "message-added" {
            return Ok(None);
        }
        let user = Self::user(&subscription.resource_scope.resource);
        let message_id = string_field(&record.payload, "id").unwrap_or_else(|| record.change_id.clone());
        let url = self.user_url(user, &format!("messages/{message_id}"));
        let message = send_json(ctx, ctx.http.get(url).query(&[("format", "full")])).await?;
        Ok(Some(message_details(&record.payload, &message)))
    }
}

/// Headers kept from a message, under their canonical spelling.
const KEPT_HEADERS: [&str; 6] = ["From", "To", "Cc", "Subject", "Date", "Message-Id"];

fn message_details(listed: &Value, message: &Value) -> Value {
    let mut headers = serde_json::Map::new();
    for header in message.pointer("/payload/headers").and_then(Value::as_array).into_iter().flatten() {
        let (Some(name), Some(value)) = (header.get("name").and_then(Value::as_str), header.get("value")) else {
            continue;
        };
        if let Some(kept) = KEPT_HEADERS.iter().find(|k| k.eq_ignore_ascii_case(name)) {
            headers.entry(kept.to_string()).or_insert_with(|| value.clone());
        }
    }
    let mut attachments = Vec::new();
    if let Some(part) = message.get("payload") {
        collect_attachments(part, &mut attachments);
    }

    let mut details = listed.clone();
    if let Value::Object(map) = &mut details {
        for key in ["threadId", "labelIds", "snippet", "internalDate", "sizeEstimate"] {
            if let Some(value) = message.get(key) {
                map.insert(key.to_string(), value.clone());
            }
        }
        map.insert("headers".into(), Value::Object(headers));
        map.insert("has_attachments".into(), json!(!attachments.is_empty()));
        map.insert("attachments".into(), Value::Array(attachments));
    }
    details
}

fn collect_attachments(part: &Value, out: &mut Vec<Value>) {
    if let Some(filename) = part.get("filename").and_then(Value::as_str).filter(|f| !f.is_empty()) {
        let body = part.get("body");
        out.push(json!({
            "filename": filename,
            "mimeType": part.get("mimeType").cloned().unwrap_or(Value::Null),
            "size": body.and_then(|b| b.get("size")).cloned().unwrap_or(Value::Null),
            "attachmentId": body.and_then(|b| b.get("attachmentId")).cloned().unwrap_or(Value::Null),
        }));
    }
    for child in part.get("parts").and_then(Value::as_array).into_iter().flatten() {
        collect_attachments(child, out);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    next_page_token: Option<String>,
    history_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    id: Option<Value>,
    #[serde(default)]
    messages_added: Vec<Value>,
    #[serde(default)]
    messages_deleted: Vec<Value>,
    #[serde(default)]
    labels_added: Vec<Value>,
    #[serde(default)]
    labels_removed: Vec<Value>,
}

impl HistoryEntry {
    /// Flattens one history record into its families, in feed order.
    fn raw_changes(&self) -> Vec<RawChange> {
        let hint = match &self.id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let families: [(&str, &Vec<Value>); 4] = [
            ("messagesAdded", &self.messages_added),
            ("messagesDeleted", &self.messages_deleted),
            ("labelsAdded", &self.labels_added),
            ("labelsRemoved", &self.labels_removed),
        ];
        let mut out = Vec::new();
        for (kind, items) in families {
            for item in items {
                let mut body = item.clone();
                if let (Value::Object(map), Some(h)) = (&mut body, &hint) {
                    map.insert("historyRecordId".into(), json!(h));
                }
                out.push(RawChange::new(kind, hint.clone(), body));
            }
        }
        out
    }
}

/// The Gmail payload inside a Pub/Sub push.
#[derive(Debug, Clone, PartialEq)]
pub struct GmailNotification {
    pub email_address: String,
    pub history_id: String,
}

/// Decodes `{"message": {"data": base64(json)}}`. Call only on verified bodies.
pub fn decode_push(body: &[u8]) -> Result<GmailNotification, ProviderError> {
    let envelope: Value = serde_json::from_slice(body)?;
    let data = envelope
        .pointer("/message/data")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Decode("missing Pub/Sub message.data".into()))?;
    let decoded = general_purpose::STANDARD
        .decode(data)
        .or_else(|_| general_purpose::URL_SAFE.decode(data))
        .map_err(|e| ProviderError::Decode(format!("invalid Pub/Sub data: {e}")))?;
    let inner: Value = serde_json::from_slice(&decoded)?;

    let email_address = string_field(&inner, "emailAddress");
    let history_id = string_field(&inner, "historyId");
    match (email_address, history_id) {
        (Some(email_address), Some(history_id)) => Ok(GmailNotification { email_address, history_id }),
        _ => Err(ProviderError::Decode("missing historyId or emailAddress in Gmail notification".into())),
    }
}

fn message_fields(raw: &RawChange) -> Result<(String, Value), ProviderError> {
    let message = raw
        .body
        .get("message")
        .ok_or_else(|| ProviderError::Decode(format!("{} item without message", raw.kind)))?;
    let id = string_field(message, "id")
        .ok_or_else(|| ProviderError::Decode(format!("{} item without message id", raw.kind)))?;
    let payload = json!({
        "id": id,
        "threadId": message.get("threadId").cloned().unwrap_or(Value::Null),
        "labelIds": message.get("labelIds").cloned().unwrap_or_else(|| json!([])),
    });
    Ok((id, payload))
}

fn classify_message_added(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    let (id, payload) = message_fields(raw)?;
    Ok(ChangeRecord { change_id: id, family: "message-added".into(), payload, sequence_hint: raw.sequence_hint.clone() })
}

fn classify_message_deleted(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    let (id, payload) = message_fields(raw)?;
    Ok(ChangeRecord { change_id: id, family: "message-deleted".into(), payload, sequence_hint: raw.sequence_hint.clone() })
}

fn classify_label_change(raw: &RawChange, family: &str) -> Result<ChangeRecord, ProviderError> {
    let (id, mut payload) = message_fields(raw)?;
    let labels = raw.body.get("labelIds").cloned().unwrap_or_else(|| json!([]));
    let label_list = labels
        .as_array()
        .map(|l| l.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(","))
        .unwrap_or_default();
    let record = raw.sequence_hint.clone().unwrap_or_default();
    // Labels can flip on the same message many times; the history record makes it unique.
    let change_id = ChangeRecord::derived_id(family, &[&id, &record, &label_list]);
    payload["changedLabelIds"] = labels;
    Ok(ChangeRecord { change_id, family: family.into(), payload, sequence_hint: raw.sequence_hint.clone() })
}

fn classify_label_added(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    classify_label_change(raw, "label-added")
}

fn classify_label_removed(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    classify_label_change(raw, "label-removed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use trigger_plugin::message::{ResourceScope, SubscriptionStatus};

    fn subscription() -> Subscription {
        Subscription {
            subscription_id: "s1".into(),
            provider_id: PROVIDER_ID.into(),
            resource_scope: ResourceScope::new("me").with_param("topic_name", json!("projects/p/topics/gmail")),
            callback_url: "https://hooks.example/gmail".into(),
            external_channel_id: None,
            external_resource_id: None,
            expires_at: None,
            renewed_at: Utc::now(),
            verification_secret: "secret".into(),
            status: SubscriptionStatus::Active,
            properties: Default::default(),
            version: 1,
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(reqwest::Client::new(), "access")
    }

    fn push_body(email: &str, history_id: u64) -> Vec<u8> {
        let inner = json!({"emailAddress": email, "historyId": history_id}).to_string();
        json!({"message": {"data": general_purpose::STANDARD.encode(inner), "messageId": "1"}, "subscription": "projects/p/subscriptions/s"})
            .to_string()
            .into_bytes()
    }

    #[test]
    fn decodes_pubsub_envelope() {
        let n = decode_push(&push_body("a@example.com", 4242)).unwrap();
        assert_eq!(n.email_address, "a@example.com");
        assert_eq!(n.history_id, "4242");
        assert!(decode_push(br#"{"message":{}}"#).is_err());
    }

    #[tokio::test]
    async fn watch_defaults_expiry_when_missing() {
        let server = MockServer::start_async().await;
        let watch = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/users/me/watch")
                    .header("authorization", "Bearer access")
                    .json_body(json!({"topicName": "projects/p/topics/gmail"}));
                then.status(200).json_body(json!({"historyId": "100"}));
            })
            .await;

        let provider = GmailProvider::with_base_url(server.base_url());
        let sub = subscription();
        let request = SubscribeRequest {
            subscription_id: sub.subscription_id.clone(),
            scope: sub.resource_scope.clone(),
            callback_url: sub.callback_url.clone(),
            verification_secret: "secret".into(),
            channel_id: "c1".into(),
        };
        let grant = provider.subscribe(&ctx(), &request).await.unwrap();

        watch.assert_async().await;
        assert_eq!(grant.baseline, Some(Cursor::new("100")));
        let expires = grant.expires_at.unwrap();
        assert!(expires > Utc::now() + Duration::days(5));
    }

    #[tokio::test]
    async fn history_pages_and_classifies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/me/history").query_param("startHistoryId", "100").query_param("pageToken", "p2");
                then.status(200).json_body(json!({
                    "history": [{"id": "102", "labelsRemoved": [{"message": {"id": "m2", "threadId": "t2"}, "labelIds": ["UNREAD"]}]}],
                    "historyId": "102"
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                // Registered second so the page-two mock above wins when both match.
                when.method(GET).path("/users/me/history").query_param("startHistoryId", "100");
                then.status(200).json_body(json!({
                    "history": [{"id": "101", "messagesAdded": [{"message": {"id": "m1", "threadId": "t1", "labelIds": ["INBOX"]}}]}],
                    "nextPageToken": "p2",
                    "historyId": "102"
                }));
            })
            .await;

        let provider = GmailProvider::with_base_url(server.base_url());
        let sub = subscription();
        let first = provider.list_changes(&ctx(), &sub, &Cursor::new("100"), None).await.unwrap();
        assert_eq!(first.changes.len(), 1);
        assert_eq!(first.next_page_token.as_deref(), Some("p2"));
        assert!(first.cursor.is_none());

        let second = provider.list_changes(&ctx(), &sub, &Cursor::new("100"), Some("p2")).await.unwrap();
        assert_eq!(second.cursor, Some(Cursor::new("102")));

        let added = classify_message_added(&first.changes[0]).unwrap();
        assert_eq!(added.family, "message-added");
        assert_eq!(added.change_id, "m1");
        let removed = classify_label_removed(&second.changes[0]).unwrap();
        assert_eq!(removed.family, "label-removed");
        assert_eq!(removed.payload["changedLabelIds"], json!(["UNREAD"]));
    }

    #[tokio::test]
    async fn stale_history_id_is_cursor_expired() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/me/history");
                then.status(404).json_body(json!({"error": {"code": 404, "message": "Requested entity was not found."}}));
            })
            .await;

        let provider = GmailProvider::with_base_url(server.base_url());
        let err = provider.list_changes(&ctx(), &subscription(), &Cursor::new("1"), None).await.unwrap_err();
        assert!(matches!(err, ProviderError::CursorExpired(c) if c == "1"));
    }

    #[tokio::test]
    async fn new_messages_are_enriched_with_headers_and_attachments() {
        let server = MockServer::start_async().await;
        let get = server
            .mock_async(|when, then| {
                when.method(GET).path("/users/me/messages/m1").query_param("format", "full");
                then.status(200).json_body(json!({
                    "id": "m1",
                    "threadId": "t1",
                    "labelIds": ["INBOX", "UNREAD"],
                    "snippet": "Quarterly numbers attached",
                    "internalDate": "1700000000000",
                    "payload": {
                        "headers": [
                            {"name": "From", "value": "Ann <ann@example.com>"},
                            {"name": "Subject", "value": "Q3 report"},
                            {"name": "Message-ID", "value": "<abc@mail>"},
                            {"name": "Received", "value": "by mx"}
                        ],
                        "parts": [
                            {"mimeType": "text/plain", "filename": "", "body": {"size": 12}},
                            {"mimeType": "application/pdf", "filename": "q3.pdf", "body": {"attachmentId": "att1", "size": 2048}}
                        ]
                    }
                }));
            })
            .await;

        let provider = GmailProvider::with_base_url(server.base_url());
        let raw = RawChange::new("messagesAdded", Some("101".into()), json!({"message": {"id": "m1", "threadId": "t1"}}));
        let record = classify_message_added(&raw).unwrap();
        let payload = provider.enrich(&ctx(), &subscription(), &record).await.unwrap().unwrap();

        get.assert_async().await;
        assert_eq!(payload["id"], json!("m1"));
        assert_eq!(payload["headers"]["From"], json!("Ann <ann@example.com>"));
        assert_eq!(payload["headers"]["Message-Id"], json!("<abc@mail>"));
        assert!(payload["headers"].get("Received").is_none());
        assert_eq!(payload["labelIds"], json!(["INBOX", "UNREAD"]));
        assert_eq!(payload["has_attachments"], json!(true));
        assert_eq!(payload["attachments"][0]["filename"], json!("q3.pdf"));
        assert_eq!(payload["attachments"].as_array().unwrap().len(), 1);

        let removed = RawChange::new("labelsRemoved", None, json!({"message": {"id": "m1"}, "labelIds": ["UNREAD"]}));
        let label_record = classify_label_removed(&removed).unwrap();
        assert!(provider.enrich(&ctx(), &subscription(), &label_record).await.unwrap().is_none());
    }

    #[test]
    fn label_changes_on_same_message_get_distinct_ids() {
        let a = RawChange::new("labelsAdded", Some("101".into()), json!({"message": {"id": "m1"}, "labelIds": ["STARRED"]}));
        let b = RawChange::new("labelsAdded", Some("105".into()), json!({"message": {"id": "m1"}, "labelIds": ["STARRED"]}));
        assert_ne!(classify_label_added(&a).unwrap().change_id, classify_label_added(&b).unwrap().change_id);
        let bad = RawChange::new("messagesAdded", None, json!({"message": {}}));
        assert!(classify_message_added(&bad).is_err());
    }
}
