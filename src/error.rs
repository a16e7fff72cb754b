use thiserror::Error;
use trigger_plugin::plugin::ProviderError;

use crate::secret::SecretsError;

/// Everything the engine can fail with, as seen by the host.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The delivery could not be proven to come from the provider.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The refresh token itself is gone; a human must re-run authorization.
    #[error("credential expired for {provider} subscription {subscription_id}: {reason}")]
    CredentialExpired {
        subscription_id: String,
        provider: String,
        reason: String,
    },

    #[error("checkpoint for {0} was advanced by a concurrent pass")]
    CheckpointConflict(String),

    /// A stored record changed between read and write.
    #[error("{0} was modified concurrently")]
    VersionConflict(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider refused the call for a reason retrying will not fix.
    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("renewal of {subscription_id} failed after {attempts} attempts: {reason}")]
    RenewalExhausted {
        subscription_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Maps a provider failure into the engine taxonomy for one subscription.
    pub fn from_provider(err: ProviderError, subscription_id: &str, provider: &str) -> Self {
        match err {
            ProviderError::Unavailable(reason) => EngineError::ProviderUnavailable(reason),
            ProviderError::Timeout => EngineError::ProviderUnavailable("provider call timed out".into()),
            ProviderError::CredentialExpired(reason) => EngineError::CredentialExpired {
                subscription_id: subscription_id.to_string(),
                provider: provider.to_string(),
                reason,
            },
            ProviderError::CursorExpired(cursor) => {
                EngineError::ProviderRejected(format!("cursor {cursor} expired"))
            }
            ProviderError::Rejected { status, body } => {
                EngineError::ProviderRejected(format!("status {status}: {body}"))
            }
            ProviderError::Decode(reason) => EngineError::Serialization(reason),
        }
    }

    /// Failures worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderUnavailable(_)
                | EngineError::CheckpointConflict(_)
                | EngineError::VersionConflict(_)
        )
    }

    /// Text meant for the person operating the trigger.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::AuthenticationFailed(reason) => format!(
                "Delivery rejected ({reason}). Check that the provider is configured with this subscription's verification secret or signing key."
            ),
            EngineError::CredentialExpired { subscription_id, provider, .. } => format!(
                "Re-authorize {provider} for subscription {subscription_id}: the stored refresh token was revoked or expired."
            ),
            EngineError::RenewalExhausted { subscription_id, .. } => format!(
                "Subscription {subscription_id} could not be renewed and was revoked; deliveries have stopped. Re-run subscribe."
            ),
            EngineError::ProviderUnavailable(reason) => {
                format!("The provider is temporarily unavailable ({reason}); the delivery can be retried.")
            }
            EngineError::NotFound(what) => format!("{what} does not exist."),
            EngineError::InvalidConfig(reason) => format!("Fix the subscription configuration: {reason}"),
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<SecretsError> for EngineError {
    fn from(err: SecretsError) -> Self {
        match err {
            SecretsError::NotFound(name) => EngineError::InvalidConfig(format!("secret {name} is not set")),
            other => EngineError::Store(other.to_string()),
        }
    }
}

impl From<serde_yaml_bw::Error> for EngineError {
    fn from(err: serde_yaml_bw::Error) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}
