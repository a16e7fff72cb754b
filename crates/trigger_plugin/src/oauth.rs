use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::plugin::ProviderError;

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Client registration used to refresh tokens. Values come from the secrets store.
#[derive(Clone, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// A freshly issued access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchange a refresh token for a new access token.
///
/// `invalid_grant` means the refresh token itself is gone, which is surfaced as
/// `CredentialExpired` so the caller asks for re-authorization instead of retrying.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    token_url: &str,
    client: &OAuthClient,
    refresh_token: &str,
) -> Result<TokenGrant, ProviderError> {
    let response = http
        .post(token_url)
        .form(&[
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await?;
    let status = response.status().as_u16();
    let text = response.text().await?;
    let parsed: TokenResponse = serde_json::from_str(&text).unwrap_or(TokenResponse {
        access_token: None,
        refresh_token: None,
        expires_in: None,
        error: None,
        error_description: Some(text.clone()),
    });

    if let Some(error) = parsed.error.as_deref() {
        if matches!(error, "invalid_grant" | "unauthorized_client" | "invalid_client") {
            return Err(ProviderError::CredentialExpired(
                parsed.error_description.unwrap_or_else(|| error.to_string()),
            ));
        }
    }
    if !(200..300).contains(&status) {
        warn!(status, "token refresh failed");
        return Err(ProviderError::from_status(status, text));
    }

    let access_token = parsed
        .access_token
        .ok_or_else(|| ProviderError::Decode("token response without access_token".into()))?;
    let expires_at = parsed
        .expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| Utc::now() + Duration::seconds(secs));

    Ok(TokenGrant {
        access_token,
        // Google only returns a refresh token on first consent; keep the old one.
        refresh_token: parsed.refresh_token.or_else(|| Some(refresh_token.to_string())),
        expires_at,
    })
}
