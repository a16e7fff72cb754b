use std::time::Duration;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{
    ChangePage, ChangeRecord, ChannelGrant, Cursor, Delivery, DeliveryHint, RawChange, ResourceScope,
    Subscription,
};

/// What log levels are supported?
/// Higher‐value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }

    pub fn parse(level: &str) -> LogLevel {
        match level.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

/// How a provider keeps a channel alive past its expiry.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RenewalMode {
    /// Re-issuing the watch extends the same channel.
    ExtendInPlace,
    /// Renewal allocates a new channel; the old one must be stopped afterwards.
    Reallocate,
}

/// Everything a provider call needs besides its own arguments.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub http: reqwest::Client,
    pub bearer: String,
}

impl CallContext {
    pub fn new(http: reqwest::Client, bearer: impl Into<String>) -> Self {
        Self { http, bearer: bearer.into() }
    }

    /// A client whose every request is bounded by `timeout`.
    pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
        reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))
    }
}

/// Arguments for creating a provider-side watch.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub subscription_id: String,
    pub scope: ResourceScope,
    pub callback_url: String,
    /// Engine-generated; providers that echo a token back use it verbatim.
    pub verification_secret: String,
    /// Engine-generated channel id for providers that let the caller choose it.
    pub channel_id: String,
}

/// A pure mapping from one raw-change shape to a ChangeRecord.
pub type ClassifyFn = fn(&RawChange) -> Result<ChangeRecord, ProviderError>;

/// The one trait provider authors implement.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider identity, e.g. "gmail".
    fn id(&self) -> &str;

    fn renewal_mode(&self) -> RenewalMode;

    /// OAuth token endpoint, or None when the provider only uses static credentials.
    fn token_endpoint(&self) -> Option<&str>;

    /// Registers the watch and returns the provider-assigned channel.
    async fn subscribe(&self, ctx: &CallContext, request: &SubscribeRequest) -> Result<ChannelGrant, ProviderError>;

    /// Extends or reallocates the channel, depending on `renewal_mode`.
    async fn renew(&self, ctx: &CallContext, subscription: &Subscription, channel_id: &str) -> Result<ChannelGrant, ProviderError>;

    /// Tears down one specific channel.
    async fn unsubscribe(
        &self,
        ctx: &CallContext,
        subscription: &Subscription,
        external_channel_id: Option<&str>,
        external_resource_id: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// The current head of the feed, used as a "start now" marker.
    async fn baseline(&self, ctx: &CallContext, subscription: &Subscription) -> Result<Cursor, ProviderError>;

    /// One page of changes after `cursor`. `CursorExpired` signals a gap.
    async fn list_changes(
        &self,
        ctx: &CallContext,
        subscription: &Subscription,
        cursor: &Cursor,
        page_token: Option<&str>,
    ) -> Result<ChangePage, ProviderError>;

    /// Reads an already-verified delivery. Never trusted beyond advice.
    fn parse_hint(&self, subscription: &Subscription, delivery: &Delivery) -> Result<DeliveryHint, ProviderError>;

    /// Classification table entries keyed by raw change kind.
    fn classifiers(&self) -> Vec<(&'static str, ClassifyFn)>;

    /// Replacement payload for a classified record, for feeds that only carry ids.
    /// `None` keeps the record as classified.
    async fn enrich(
        &self,
        _ctx: &CallContext,
        _subscription: &Subscription,
        _record: &ChangeRecord,
    ) -> Result<Option<serde_json::Value>, ProviderError> {
        Ok(None)
    }
}

/// Errors that a Provider implementation can return.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Network failure, 5xx or throttling.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call timed out")]
    Timeout,

    /// The bearer or refresh token was refused.
    #[error("credential expired: {0}")]
    CredentialExpired(String),

    /// The checkpointed cursor is too old for the feed.
    #[error("cursor {0} is no longer valid")]
    CursorExpired(String),

    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed provider data: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Maps a non-success HTTP status onto the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 => ProviderError::CredentialExpired(body),
            408 => ProviderError::Timeout,
            429 | 500..=599 => ProviderError::Unavailable(format!("status {status}: {body}")),
            _ => ProviderError::Rejected { status, body },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_) | ProviderError::Timeout)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> ProviderError {
        ProviderError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert!(matches!(ProviderError::from_status(401, "x"), ProviderError::CredentialExpired(_)));
        assert!(ProviderError::from_status(503, "x").is_transient());
        assert!(ProviderError::from_status(429, "x").is_transient());
        assert!(ProviderError::from_status(408, "x").is_transient());
        let rejected = ProviderError::from_status(400, "bad");
        assert!(!rejected.is_transient());
        assert!(matches!(rejected, ProviderError::Rejected { status: 400, .. }));
    }

    #[test]
    fn log_level_parses_loosely() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("nonsense"), LogLevel::Info);
        assert_eq!(LogLevel::Critical.as_filter(), "error");
    }
}
