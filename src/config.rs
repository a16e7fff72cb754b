use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use tracing::{info, warn};

use crate::error::EngineError;

/// Key/value configuration source. Serialisable so a running engine can report where
/// its settings came from.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file and written back to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded config from {}", env_file.display());
        } else {
            warn!("no config file at {}, using process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }

    /// Rewrites the `.env` file with `key` replaced (or removed when `value` is None).
    fn rewrite_file(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;
        for line in content.lines() {
            let is_key = line.split_once('=').is_some_and(|(k, _)| k.trim() == key);
            if !is_key {
                lines.push(line.to_string());
                continue;
            }
            found = true;
            if let Some(v) = value {
                lines.push(format!("{key}={v}"));
            }
        }
        if !found {
            if let Some(v) = value {
                lines.push(format!("{key}={v}"));
            }
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            let _ = self.rewrite_file(key, None);
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self { map: DashMap::new() })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

pub const DB_PATH: &str = "CHANGEFEED_DB_PATH";
pub const PROVIDER_TIMEOUT_SECS: &str = "CHANGEFEED_PROVIDER_TIMEOUT_SECS";
pub const DEDUPE_RETENTION_SECS: &str = "CHANGEFEED_DEDUPE_RETENTION_SECS";
pub const RENEWAL_MIN_MARGIN_SECS: &str = "CHANGEFEED_RENEWAL_MIN_MARGIN_SECS";
pub const RETRY_MAX_ATTEMPTS: &str = "CHANGEFEED_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_MS: &str = "CHANGEFEED_RETRY_BASE_MS";
pub const RETRY_MAX_MS: &str = "CHANGEFEED_RETRY_MAX_MS";
pub const CONFLICT_RETRIES: &str = "CHANGEFEED_CONFLICT_RETRIES";

/// Engine-wide tunables. Per-subscription settings live in `SubscriptionConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub db_path: Option<PathBuf>,
    pub provider_timeout: Duration,
    pub dedupe_retention: Duration,
    pub renewal_min_margin: Duration,
    pub retry_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            provider_timeout: Duration::from_secs(10),
            dedupe_retention: Duration::from_secs(86_400),
            renewal_min_margin: Duration::from_secs(3_600),
            retry_max_attempts: 4,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_millis(8_000),
            conflict_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Reads every `CHANGEFEED_*` key, falling back to defaults for absent ones.
    pub async fn load(config: &ConfigManager) -> Result<Self, EngineError> {
        let defaults = Self::default();
        let secs = |d: Duration| d.as_secs();
        let millis = |d: Duration| d.as_millis() as u64;

        let db_path = config.0.get(DB_PATH).await.filter(|p| !p.trim().is_empty()).map(PathBuf::from);
        let engine = Self {
            db_path,
            provider_timeout: Duration::from_secs(
                read_number(config, PROVIDER_TIMEOUT_SECS, secs(defaults.provider_timeout)).await?,
            ),
            dedupe_retention: Duration::from_secs(
                read_number(config, DEDUPE_RETENTION_SECS, secs(defaults.dedupe_retention)).await?,
            ),
            renewal_min_margin: Duration::from_secs(
                read_number(config, RENEWAL_MIN_MARGIN_SECS, secs(defaults.renewal_min_margin)).await?,
            ),
            retry_max_attempts: read_number(config, RETRY_MAX_ATTEMPTS, defaults.retry_max_attempts as u64).await? as u32,
            retry_base: Duration::from_millis(read_number(config, RETRY_BASE_MS, millis(defaults.retry_base)).await?),
            retry_max: Duration::from_millis(read_number(config, RETRY_MAX_MS, millis(defaults.retry_max)).await?),
            conflict_retries: read_number(config, CONFLICT_RETRIES, defaults.conflict_retries as u64).await? as u32,
        };

        if engine.provider_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(format!("{PROVIDER_TIMEOUT_SECS} must be positive")));
        }
        if engine.retry_max_attempts == 0 {
            return Err(EngineError::InvalidConfig(format!("{RETRY_MAX_ATTEMPTS} must be at least 1")));
        }
        if engine.retry_base > engine.retry_max {
            return Err(EngineError::InvalidConfig(format!("{RETRY_BASE_MS} exceeds {RETRY_MAX_MS}")));
        }
        Ok(engine)
    }
}

async fn read_number(config: &ConfigManager, key: &str, default: u64) -> Result<u64, EngineError> {
    match config.0.get(key).await {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| EngineError::InvalidConfig(format!("{key}={raw} is not a non-negative integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_config_manager_set_get_del() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar").await.unwrap();
        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);
        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn env_config_manager_reads_dotenv_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "CF_TEST_DOTENV_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("CF_TEST_DOTENV_KEY").await, Some("abc123".to_string()));
    }

    #[tokio::test]
    async fn env_config_manager_writes_back_and_removes() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "OTHER=1\n").unwrap();
        let mgr = EnvConfigManager::new(env_path.clone());

        mgr.set("CF_TEST_WRITE_KEY", "v1").await.unwrap();
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("CF_TEST_WRITE_KEY=v1"));
        assert!(content.contains("OTHER=1"));

        mgr.del("CF_TEST_WRITE_KEY").await;
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(!content.contains("CF_TEST_WRITE_KEY"));
        assert_eq!(std::env::var("CF_TEST_WRITE_KEY").ok(), None);
    }

    #[tokio::test]
    async fn engine_config_defaults_and_overrides() {
        let config = ConfigManager(MapConfigManager::new());
        let engine = EngineConfig::load(&config).await.unwrap();
        assert_eq!(engine, EngineConfig::default());

        config.0.set(PROVIDER_TIMEOUT_SECS, "3").await.unwrap();
        config.0.set(CONFLICT_RETRIES, "7").await.unwrap();
        config.0.set(DB_PATH, "/tmp/cf.db").await.unwrap();
        let engine = EngineConfig::load(&config).await.unwrap();
        assert_eq!(engine.provider_timeout, Duration::from_secs(3));
        assert_eq!(engine.conflict_retries, 7);
        assert_eq!(engine.db_path, Some(PathBuf::from("/tmp/cf.db")));
    }

    #[tokio::test]
    async fn engine_config_rejects_garbage() {
        let config = ConfigManager(MapConfigManager::new());
        config.0.set(RETRY_MAX_ATTEMPTS, "many").await.unwrap();
        assert!(matches!(EngineConfig::load(&config).await, Err(EngineError::InvalidConfig(_))));
    }
}
