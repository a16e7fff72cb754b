use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use trigger_plugin::{
    message::{ChangePage, ChangeRecord, ChannelGrant, Cursor, Delivery, DeliveryHint, RawChange, ResourceScope, Subscription},
    oauth::GOOGLE_TOKEN_URL,
    plugin::{CallContext, ClassifyFn, Provider, ProviderError, RenewalMode, SubscribeRequest},
    plugin_helpers::{millis_field, send_empty, send_json, string_field},
};

pub const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
pub const PROVIDER_ID: &str = "drive";

/// Drive refuses channel lifetimes beyond a week.
const MAX_TTL_SECS: u64 = 604_800;

const CHANGE_FIELDS: &str =
    "nextPageToken,newStartPageToken,changes(changeType,removed,fileId,driveId,time,file(id,name,mimeType,trashed,modifiedTime),drive(id,name))";

/// Watches the Drive changes feed with `changes.watch` channels.
///
/// Each renewal opens a new channel; the engine stops the old one once the new
/// channel is stored.
pub struct DriveProvider {
    base_url: String,
}

impl Default for DriveProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveProvider {
    pub fn new() -> Self {
        Self { base_url: DRIVE_API.to_string() }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{}", self.base_url, tail)
    }

    async fn start_page_token(&self, ctx: &CallContext, spaces: &str) -> Result<Cursor, ProviderError> {
        let response = send_json(ctx, ctx.http.get(self.url("changes/startPageToken")).query(&[("spaces", spaces)])).await?;
        string_field(&response, "startPageToken")
            .map(Cursor::new)
            .ok_or_else(|| ProviderError::Decode("startPageToken not present in response".into()))
    }

    async fn open_channel(
        &self,
        ctx: &CallContext,
        scope: &ResourceScope,
        callback_url: &str,
        channel_id: &str,
        token: &str,
    ) -> Result<ChannelGrant, ProviderError> {
        let spaces = spaces(scope)?;
        let start = self.start_page_token(ctx, &spaces).await?;

        let mut body = json!({
            "id": channel_id,
            "type": "web_hook",
            "address": callback_url,
            "token": token,
            "payload": true,
        });
        if let Some(ttl) = lifetime_secs(scope)? {
            body["params"] = json!({ "ttl": ttl.to_string() });
        }

        let request = ctx
            .http
            .post(self.url("changes/watch"))
            .query(&[("pageToken", start.as_str()), ("spaces", spaces.as_str()), ("supportsAllDrives", "true")])
            .json(&body);
        let response = send_json(ctx, request).await?;

        let resource_id = string_field(&response, "resourceId")
            .ok_or_else(|| ProviderError::Decode("watch response without resourceId".into()))?;
        let expires_at = millis_field(&response, "expiration").and_then(DateTime::<Utc>::from_timestamp_millis);
        info!(channel_id, resource_id = %resource_id, "drive channel opened");

        Ok(ChannelGrant {
            external_channel_id: Some(channel_id.to_string()),
            external_resource_id: Some(resource_id),
            expires_at,
            baseline: Some(start),
            properties: Default::default(),
        })
    }
}

/// `spaces` may be a comma separated string or a list; defaults to `drive`.
fn spaces(scope: &ResourceScope) -> Result<String, ProviderError> {
    let joined = match scope.params.get("spaces") {
        None | Some(Value::Null) => "drive".to_string(),
        Some(Value::String(s)) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(","),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(","),
        Some(_) => return Err(ProviderError::Rejected { status: 400, body: "spaces must be a string or list of strings".into() }),
    };
    if joined.is_empty() {
        return Err(ProviderError::Rejected { status: 400, body: "at least one Drive space must be selected".into() });
    }
    Ok(joined)
}

fn lifetime_secs(scope: &ResourceScope) -> Result<Option<u64>, ProviderError> {
    let raw = match scope.params.get("lifetime_seconds") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) if s.is_empty() => return Ok(None),
        Some(Value::String(s)) => s.parse::<u64>().ok(),
        Some(_) => None,
    };
    match raw {
        Some(secs) if secs > 0 => Ok(Some(secs.min(MAX_TTL_SECS))),
        _ => Err(ProviderError::Rejected { status: 400, body: "lifetime_seconds must be a positive number".into() }),
    }
}

#[async_trait]
impl Provider for DriveProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn renewal_mode(&self) -> RenewalMode {
        RenewalMode::Reallocate
    }

    fn token_endpoint(&self) -> Option<&str> {
        Some(GOOGLE_TOKEN_URL)
    }

    async fn subscribe(&self, ctx: &CallContext, request: &SubscribeRequest) -> Result<ChannelGrant, ProviderError> {
        self.open_channel(ctx, &request.scope, &request.callback_url, &request.channel_id, &request.verification_secret)
            .await
    }

    async fn renew(&self, ctx: &CallContext, subscription: &Subscription, channel_id: &str) -> Result<ChannelGrant, ProviderError> {
        let mut grant = self
            .open_channel(
                ctx,
                &subscription.resource_scope,
                &subscription.callback_url,
                channel_id,
                &subscription.verification_secret,
            )
            .await?;
        // The committed checkpoint stays authoritative across channels.
        grant.baseline = None;
        Ok(grant)
    }

    async fn unsubscribe(
        &self,
        ctx: &CallContext,
        _subscription: &Subscription,
        external_channel_id: Option<&str>,
        external_resource_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let (Some(id), Some(resource_id)) = (external_channel_id, external_resource_id) else {
            return Err(ProviderError::Rejected { status: 400, body: "channel metadata missing".into() });
        };
        let body = json!({ "id": id, "resourceId": resource_id });
        send_empty(ctx, ctx.http.post(self.url("channels/stop")).json(&body)).await
    }

    async fn baseline(&self, ctx: &CallContext, subscription: &Subscription) -> Result<Cursor, ProviderError> {
        self.start_page_token(ctx, &spaces(&subscription.resource_scope)?).await
    }

    async fn list_changes(
        &self,
        ctx: &CallContext,
        subscription: &Subscription,
        cursor: &Cursor,
        page_token: Option<&str>,
    ) -> Result<ChangePage, ProviderError> {
        let spaces = spaces(&subscription.resource_scope)?;
        // Drive pages by handing out the next pageToken itself.
        let token = page_token.unwrap_or(cursor.as_str());
        let request = ctx.http.get(self.url("changes")).query(&[
            ("pageToken", token),
            ("spaces", spaces.as_str()),
            ("includeRemoved", "true"),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
            ("fields", CHANGE_FIELDS),
        ]);

        let data = match send_json(ctx, request).await {
            Ok(data) => data,
            Err(ProviderError::Rejected { status: 404 | 410, .. }) => {
                return Err(ProviderError::CursorExpired(cursor.to_string()));
            }
            Err(err) => return Err(err),
        };

        let page: ChangesPage = serde_json::from_value(data)?;
        let changes: Vec<RawChange> = page.changes.into_iter().map(raw_change).collect();
        debug!(changes = changes.len(), more = page.next_page_token.is_some(), "drive changes page");

        Ok(ChangePage {
            changes,
            cursor: page.new_start_page_token.map(Cursor::new),
            next_page_token: page.next_page_token,
        })
    }

    fn parse_hint(&self, subscription: &Subscription, delivery: &Delivery) -> Result<DeliveryHint, ProviderError> {
        let state = delivery.header("X-Goog-Resource-State").unwrap_or_default().to_ascii_lowercase();
        if state == "sync" {
            return Ok(DeliveryHint::Sync);
        }
        let channel = delivery.header("X-Goog-Channel-ID");
        if channel.is_some() && channel != subscription.external_channel_id.as_deref() {
            // A superseded channel may still fire until it is stopped.
            debug!(channel = ?channel, "drive notification from a previous channel");
        }
        Ok(DeliveryHint::Changed { cursor: None })
    }

    fn classifiers(&self) -> Vec<(&'static str, ClassifyFn)> {
        vec![
            ("fileChanged", classify_file_changed as ClassifyFn),
            ("fileRemoved", classify_file_removed),
            ("driveChanged", classify_drive_changed),
        ]
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesPage {
    #[serde(default)]
    changes: Vec<Value>,
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
}

fn raw_change(change: Value) -> RawChange {
    let removed = change.get("removed").and_then(Value::as_bool).unwrap_or(false);
    let kind = match change.get("changeType").and_then(Value::as_str) {
        Some("drive") => "driveChanged",
        _ if removed => "fileRemoved",
        _ => "fileChanged",
    };
    let hint = string_field(&change, "time");
    RawChange::new(kind, hint, change)
}

fn change_identity(raw: &RawChange, id_field: &str) -> Result<(String, String), ProviderError> {
    let id = string_field(&raw.body, id_field)
        .ok_or_else(|| ProviderError::Decode(format!("{} without {id_field}", raw.kind)))?;
    let time = string_field(&raw.body, "time").unwrap_or_default();
    Ok((id, time))
}

fn classify_file_changed(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    let (file_id, time) = change_identity(raw, "fileId")?;
    let file = raw.body.get("file").cloned().unwrap_or(Value::Null);
    let payload = json!({
        "fileId": file_id,
        "time": time,
        "name": file.get("name").cloned().unwrap_or(Value::Null),
        "mimeType": file.get("mimeType").cloned().unwrap_or(Value::Null),
        "trashed": file.get("trashed").cloned().unwrap_or(json!(false)),
        "modifiedTime": file.get("modifiedTime").cloned().unwrap_or(Value::Null),
        "driveId": raw.body.get("driveId").cloned().unwrap_or(Value::Null),
    });
    Ok(ChangeRecord {
        change_id: ChangeRecord::derived_id("file-changed", &[&file_id, &time]),
        family: "file-changed".into(),
        payload,
        sequence_hint: raw.sequence_hint.clone(),
    })
}

fn classify_file_removed(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    let (file_id, time) = change_identity(raw, "fileId")?;
    Ok(ChangeRecord {
        change_id: ChangeRecord::derived_id("file-removed", &[&file_id, &time]),
        family: "file-removed".into(),
        payload: json!({ "fileId": file_id, "time": time, "removed": true }),
        sequence_hint: raw.sequence_hint.clone(),
    })
}

fn classify_drive_changed(raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
    let (drive_id, time) = change_identity(raw, "driveId")?;
    let drive = raw.body.get("drive").cloned().unwrap_or(Value::Null);
    Ok(ChangeRecord {
        change_id: ChangeRecord::derived_id("drive-changed", &[&drive_id, &time]),
        family: "drive-changed".into(),
        payload: json!({
            "driveId": drive_id,
            "time": time,
            "name": drive.get("name").cloned().unwrap_or(Value::Null),
            "removed": raw.body.get("removed").cloned().unwrap_or(json!(false)),
        }),
        sequence_hint: raw.sequence_hint.clone(),
    })
}
