use async_trait::async_trait;
use dashmap::DashMap;
use dotenvy::Error as DotenvError;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Named secrets (signing keys, OAuth client credentials). Subscription
/// configuration only ever stores the *name*.
#[async_trait]
pub trait SecretsManagerType: Send + Sync {
    fn keys(&self) -> Vec<String>;
    async fn reveal(&self, key: &str) -> Result<Option<String>, SecretsError>;
    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError>;
    async fn update_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError>;
    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError>;
    fn name(&self) -> &'static str;
    fn clone_box(&self) -> Arc<dyn SecretsManagerType>;
}

pub struct SecretsManager(pub Arc<dyn SecretsManagerType>);

impl SecretsManager {
    pub async fn get_secret(&self, key: &str) -> Result<Option<String>, SecretsError> {
        self.0.reveal(key).await
    }

    /// Like `get_secret`, but a missing secret is an error.
    pub async fn require(&self, key: &str) -> Result<String, SecretsError> {
        self.0.reveal(key).await?.ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    pub async fn add_secret(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        self.0.add_secret(key, value).await
    }

    pub async fn update_secret(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        self.0.update_secret(key, value).await
    }

    pub async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        self.0.delete_secret(key).await
    }
}

impl Clone for SecretsManager {
    fn clone(&self) -> Self {
        SecretsManager(self.0.clone_box())
    }
}

impl Debug for SecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {{ keys: {:?} }}", self.0.name(), self.0.keys())
    }
}

impl Serialize for SecretsManager {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // names only, never values
        let mut state = serializer.serialize_struct("SecretsManager", 2)?;
        state.serialize_field("name", self.0.name())?;
        state.serialize_field("keys", &self.0.keys())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for SecretsManager {
    fn deserialize<D>(_deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Err(serde::de::Error::custom("SecretsManager cannot be deserialized dynamically"))
    }
}

#[derive(Debug, Clone, Error)]
pub enum SecretsError {
    #[error("secret backend error: {0}")]
    Upstream(String),
    #[error("secret file error: {0}")]
    Io(String),
    #[error("secret {0} not found")]
    NotFound(String),
}

/// Secrets held in memory and persisted to `<dir>/.env`.
#[derive(Clone)]
pub struct EnvSecretsManager {
    secrets: Arc<DashMap<String, String>>,
    env_path: Option<PathBuf>,
}

impl Debug for EnvSecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvSecretsManager {{ keys: {:?} }}", self.keys())
    }
}

impl EnvSecretsManager {
    pub fn new(dotenv_dir: Option<PathBuf>) -> Arc<Self> {
        let env_path = dotenv_dir.map(|dir| dir.join(".env"));
        let mgr = Arc::new(Self { secrets: Arc::new(DashMap::new()), env_path });
        match &mgr.env_path {
            Some(path) => mgr.load_dotenv(path),
            None => info!("secrets kept in memory only (no directory given)"),
        }
        mgr
    }

    fn load_dotenv(&self, path: &Path) {
        match dotenvy::from_path_iter(path) {
            Ok(iter) => {
                self.secrets.clear();
                for item in iter {
                    match item {
                        Ok((k, v)) => {
                            self.secrets.insert(k, v);
                        }
                        Err(e) => error!("Malformed line in {}: {}", path.display(), e),
                    }
                }
                info!("secrets loaded from {}", path.display());
            }
            Err(DotenvError::Io(io)) if io.kind() == std::io::ErrorKind::NotFound => {
                info!("secrets file {} not found, starting empty", path.display());
            }
            Err(e) => error!("Failed to read {}: {}", path.display(), e),
        }
    }

    fn write_dotenv(&self) -> Result<(), SecretsError> {
        let Some(path) = &self.env_path else { return Ok(()) };
        let mut keys: Vec<String> = self.keys();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            if let Some(value) = self.secrets.get(&key) {
                out.push_str(&format!("{}={}\n", key, value.replace('\n', "\\n")));
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SecretsError::Io(e.to_string()))?;
        }
        std::fs::write(path, out).map_err(|e| SecretsError::Io(e.to_string()))
    }
}

#[async_trait]
impl SecretsManagerType for EnvSecretsManager {
    fn keys(&self) -> Vec<String> {
        self.secrets.iter().map(|kv| kv.key().clone()).collect()
    }

    async fn reveal(&self, key: &str) -> Result<Option<String>, SecretsError> {
        Ok(self.secrets.get(key).map(|v| v.clone()))
    }

    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        self.secrets.insert(key.to_string(), secret.to_string());
        self.write_dotenv()
    }

    async fn update_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        self.add_secret(key, secret).await
    }

    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        self.secrets.remove(key);
        self.write_dotenv()
    }

    fn name(&self) -> &'static str {
        "EnvSecretsManager"
    }

    fn clone_box(&self) -> Arc<dyn SecretsManagerType> {
        Arc::new(self.clone())
    }
}

/// In-memory secrets for tests and embedding.
#[derive(Clone, Default)]
pub struct MapSecretsManager {
    secrets: Arc<DashMap<String, String>>,
}

impl MapSecretsManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(self: Arc<Self>, key: &str, value: &str) -> Arc<Self> {
        self.secrets.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretsManagerType for MapSecretsManager {
    fn keys(&self) -> Vec<String> {
        self.secrets.iter().map(|kv| kv.key().clone()).collect()
    }

    async fn reveal(&self, key: &str) -> Result<Option<String>, SecretsError> {
        Ok(self.secrets.get(key).map(|v| v.clone()))
    }

    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        self.secrets.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    async fn update_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        if !self.secrets.contains_key(key) {
            return Err(SecretsError::NotFound(key.to_string()));
        }
        self.secrets.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        self.secrets
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    fn name(&self) -> &'static str {
        "MapSecretsManager"
    }

    fn clone_box(&self) -> Arc<dyn SecretsManagerType> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_secrets_round_trip() {
        let mgr = SecretsManager(MapSecretsManager::new().with("SIGNING", "s3cret"));
        assert_eq!(mgr.require("SIGNING").await.unwrap(), "s3cret");
        assert!(matches!(mgr.require("MISSING").await, Err(SecretsError::NotFound(_))));
        assert!(mgr.update_secret("MISSING", "x").await.is_err());
        mgr.delete_secret("SIGNING").await.unwrap();
        assert_eq!(mgr.get_secret("SIGNING").await.unwrap(), None);
    }

    #[tokio::test]
    async fn env_secrets_persist_to_dotenv() {
        let dir = tempdir().unwrap();
        let mgr = SecretsManager(EnvSecretsManager::new(Some(dir.path().to_path_buf())));
        let env_path = dir.path().join(".env");

        mgr.add_secret("X", "1").await.unwrap();
        assert!(fs::read_to_string(&env_path).unwrap().contains("X=1"));

        mgr.update_secret("X", "2").await.unwrap();
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("X=2"));
        assert!(!content.contains("X=1"));

        // a fresh manager reads what the first one wrote
        let reloaded = EnvSecretsManager::new(Some(dir.path().to_path_buf()));
        assert_eq!(reloaded.reveal("X").await.unwrap(), Some("2".to_string()));

        mgr.delete_secret("X").await.unwrap();
        assert!(!fs::read_to_string(&env_path).unwrap().contains("X="));
    }

    #[test]
    fn serialisation_never_leaks_values() {
        let mgr = SecretsManager(MapSecretsManager::new().with("API_KEY", "hunter2"));
        let json = serde_json::to_string(&mgr).unwrap();
        assert!(json.contains("API_KEY"));
        assert!(!json.contains("hunter2"));
    }
}
