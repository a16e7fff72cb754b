use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::plugin::{CallContext, ProviderError};

/// Attach the bearer credential and send, mapping any non-2xx onto `ProviderError`.
pub async fn send_json(ctx: &CallContext, request: RequestBuilder) -> Result<Value, ProviderError> {
    let response = request.bearer_auth(&ctx.bearer).send().await?;
    read_json(response).await
}

/// Like `send_json` but for endpoints that answer 204 or an empty body.
pub async fn send_empty(ctx: &CallContext, request: RequestBuilder) -> Result<(), ProviderError> {
    let response = request.bearer_auth(&ctx.bearer).send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), body))
}

pub async fn read_json(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        debug!(status = status.as_u16(), "provider call failed");
        return Err(ProviderError::from_status(status.as_u16(), text));
    }
    if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// String field that some Google APIs send as a number and others as a string.
pub fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Milliseconds-since-epoch field, string or number.
pub fn millis_field(value: &Value, key: &str) -> Option<i64> {
    string_field(value, key).and_then(|s| s.parse::<i64>().ok())
}
