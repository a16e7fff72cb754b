use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use trigger_plugin::message::{Checkpoint, Cursor, Subscription};

use super::{CheckpointStore, CredentialStore, DedupeLedger, StoredCredential, SubscriptionStore};
use crate::error::EngineError;

const SCHEMA_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id TEXT PRIMARY KEY,
    provider_id TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_scope
    ON subscriptions(provider_id, scope_key, status);

CREATE TABLE IF NOT EXISTS checkpoints (
    subscription_id TEXT PRIMARY KEY,
    cursor TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_reset_at TEXT
);

CREATE TABLE IF NOT EXISTS credentials (
    subscription_id TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at TEXT,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dedupe_ledger (
    dedupe_key TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dedupe_ledger_expires ON dedupe_ledger(expires_at);
";

/// Durable backend shared by every process that opens the same file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, EngineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Store(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Arc::new(Self { conn: Arc::new(Mutex::new(conn)) }))
    }

    pub fn open_in_memory() -> Result<Arc<Self>, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Arc::new(Self { conn: Arc::new(Mutex::new(conn)) }))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, EngineError>) -> Result<T, EngineError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Store("sqlite connection mutex poisoned".into()))?;
        f(&conn)
    }

    fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, EngineError>) -> Result<T, EngineError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Store("sqlite connection mutex poisoned".into()))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Store(format!("bad timestamp {raw}: {e}")))
}

fn read_checkpoint_row(conn: &Connection, subscription_id: &str) -> Result<Option<Checkpoint>, EngineError> {
    let row = conn
        .query_row(
            "SELECT cursor, updated_at, last_reset_at FROM checkpoints WHERE subscription_id = ?1",
            params![subscription_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?)),
        )
        .optional()?;
    let Some((cursor, updated_at, last_reset_at)) = row else { return Ok(None) };
    Ok(Some(Checkpoint {
        subscription_id: subscription_id.to_string(),
        cursor: Cursor::new(cursor),
        updated_at: parse_time(&updated_at)?,
        last_reset_at: last_reset_at.as_deref().map(parse_time).transpose()?,
    }))
}

fn read_credential_row(conn: &Connection, subscription_id: &str) -> Result<Option<StoredCredential>, EngineError> {
    let row = conn
        .query_row(
            "SELECT access_token, refresh_token, expires_at, version FROM credentials WHERE subscription_id = ?1",
            params![subscription_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((access_token, refresh_token, expires_at, version)) = row else { return Ok(None) };
    Ok(Some(StoredCredential {
        subscription_id: subscription_id.to_string(),
        access_token,
        refresh_token,
        expires_at: expires_at.as_deref().map(parse_time).transpose()?,
        version: version as u64,
    }))
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), EngineError> {
        let body = serde_json::to_string(subscription)?;
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO subscriptions(subscription_id, provider_id, scope_key, status, version, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    subscription.subscription_id,
                    subscription.provider_id,
                    subscription.resource_scope.key(),
                    subscription.status.as_str(),
                    subscription.version as i64,
                    body,
                ],
            )?;
            if inserted == 0 {
                return Err(EngineError::VersionConflict(format!("subscription {}", subscription.subscription_id)));
            }
            Ok(())
        })
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>, EngineError> {
        self.with_conn(|conn| {
            let body = conn
                .query_row(
                    "SELECT body FROM subscriptions WHERE subscription_id = ?1",
                    params![subscription_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(EngineError::from)).transpose()
        })
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<Subscription, EngineError> {
        let mut next = subscription.clone();
        next.version += 1;
        let body = serde_json::to_string(&next)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE subscriptions SET status = ?1, scope_key = ?2, version = ?3, body = ?4
                 WHERE subscription_id = ?5 AND version = ?6",
                params![
                    next.status.as_str(),
                    next.resource_scope.key(),
                    next.version as i64,
                    body,
                    next.subscription_id,
                    subscription.version as i64,
                ],
            )?;
            if changed == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT version FROM subscriptions WHERE subscription_id = ?1",
                        params![next.subscription_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match exists {
                    Some(_) => EngineError::VersionConflict(format!("subscription {}", next.subscription_id)),
                    None => EngineError::NotFound(format!("subscription {}", next.subscription_id)),
                });
            }
            Ok(())
        })?;
        Ok(next)
    }

    async fn find_live(&self, provider_id: &str, scope_key: &str) -> Result<Vec<Subscription>, EngineError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM subscriptions
                 WHERE provider_id = ?1 AND scope_key = ?2 AND status IN ('active', 'expiring')
                 ORDER BY subscription_id",
            )?;
            let rows = stmt.query_map(params![provider_id, scope_key], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for body in rows {
                out.push(serde_json::from_str(&body?)?);
            }
            Ok(out)
        })
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, EngineError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT body FROM subscriptions ORDER BY subscription_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for body in rows {
                out.push(serde_json::from_str(&body?)?);
            }
            Ok(out)
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn read_checkpoint(&self, subscription_id: &str) -> Result<Option<Checkpoint>, EngineError> {
        self.with_conn(|conn| read_checkpoint_row(conn, subscription_id))
    }

    async fn create_checkpoint(&self, subscription_id: &str, cursor: &Cursor) -> Result<Checkpoint, EngineError> {
        let now = Utc::now().to_rfc3339();
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO checkpoints(subscription_id, cursor, updated_at) VALUES (?1, ?2, ?3)",
                params![subscription_id, cursor.as_str(), now],
            )?;
            read_checkpoint_row(tx, subscription_id)?
                .ok_or_else(|| EngineError::Store(format!("checkpoint {subscription_id} vanished")))
        })
    }

    async fn commit(&self, subscription_id: &str, expected: &Cursor, new: &Cursor) -> Result<Checkpoint, EngineError> {
        let now = Utc::now().to_rfc3339();
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE checkpoints SET cursor = ?1, updated_at = ?2 WHERE subscription_id = ?3 AND cursor = ?4",
                params![new.as_str(), now, subscription_id, expected.as_str()],
            )?;
            let stored = read_checkpoint_row(tx, subscription_id)?
                .ok_or_else(|| EngineError::NotFound(format!("checkpoint {subscription_id}")))?;
            if changed == 0 {
                return Err(EngineError::CheckpointConflict(subscription_id.to_string()));
            }
            Ok(stored)
        })
    }

    async fn reset(&self, subscription_id: &str, expected: &Cursor, baseline: &Cursor) -> Result<Checkpoint, EngineError> {
        let now = Utc::now().to_rfc3339();
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE checkpoints SET cursor = ?1, updated_at = ?2, last_reset_at = ?2
                 WHERE subscription_id = ?3 AND cursor = ?4",
                params![baseline.as_str(), now, subscription_id, expected.as_str()],
            )?;
            let stored = read_checkpoint_row(tx, subscription_id)?
                .ok_or_else(|| EngineError::NotFound(format!("checkpoint {subscription_id}")))?;
            if changed == 0 {
                return Err(EngineError::CheckpointConflict(subscription_id.to_string()));
            }
            Ok(stored)
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get_credential(&self, subscription_id: &str) -> Result<Option<StoredCredential>, EngineError> {
        self.with_conn(|conn| read_credential_row(conn, subscription_id))
    }

    async fn put_credential(&self, credential: &StoredCredential) -> Result<StoredCredential, EngineError> {
        self.with_tx(|tx| {
            tx.execute(
                r"
                INSERT INTO credentials(subscription_id, access_token, refresh_token, expires_at, version)
                VALUES (?1, ?2, ?3, ?4, 1)
                ON CONFLICT(subscription_id) DO UPDATE SET
                  access_token = excluded.access_token,
                  refresh_token = excluded.refresh_token,
                  expires_at = excluded.expires_at,
                  version = credentials.version + 1
                ",
                params![
                    credential.subscription_id,
                    credential.access_token,
                    credential.refresh_token,
                    credential.expires_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            read_credential_row(tx, &credential.subscription_id)?
                .ok_or_else(|| EngineError::Store(format!("credential for {} vanished", credential.subscription_id)))
        })
    }

    async fn swap_credential(&self, expected_version: u64, credential: &StoredCredential) -> Result<StoredCredential, EngineError> {
        let id = &credential.subscription_id;
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE credentials SET access_token = ?1, refresh_token = ?2, expires_at = ?3, version = ?4
                 WHERE subscription_id = ?5 AND version = ?6",
                params![
                    credential.access_token,
                    credential.refresh_token,
                    credential.expires_at.map(|t| t.to_rfc3339()),
                    (expected_version + 1) as i64,
                    id,
                    expected_version as i64,
                ],
            )?;
            let stored = read_credential_row(tx, id)?
                .ok_or_else(|| EngineError::NotFound(format!("credential for {id}")))?;
            if changed == 0 {
                return Err(EngineError::VersionConflict(format!("credential for {id}")));
            }
            Ok(stored)
        })
    }

    async fn delete_credential(&self, subscription_id: &str) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM credentials WHERE subscription_id = ?1", params![subscription_id])?;
            Ok(())
        })
    }
}

#[async_trait]
impl DedupeLedger for SqliteStore {
    async fn record_if_new(&self, dedupe_key: &str, retention: Duration) -> Result<bool, EngineError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(retention.as_millis() as i64);
        self.with_tx(|tx| {
            let purged = tx.execute("DELETE FROM dedupe_ledger WHERE expires_at <= ?1", params![now])?;
            if purged > 0 {
                debug!(purged, "purged expired dedupe keys");
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO dedupe_ledger(dedupe_key, expires_at) VALUES (?1, ?2)",
                params![dedupe_key, expires_at],
            )?;
            Ok(inserted == 1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trigger_plugin::message::{ResourceScope, SubscriptionStatus};

    fn subscription(id: &str, status: SubscriptionStatus) -> Subscription {
        Subscription {
            subscription_id: id.to_string(),
            provider_id: "gmail".to_string(),
            resource_scope: ResourceScope::new("me"),
            callback_url: "https://hooks.example.com/cb".to_string(),
            external_channel_id: Some("gmail:me".to_string()),
            external_resource_id: None,
            expires_at: None,
            renewed_at: Utc::now(),
            verification_secret: "secret".to_string(),
            status,
            properties: Default::default(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("changefeed.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_subscription(&subscription("s1", SubscriptionStatus::Active)).await.unwrap();
            store.create_checkpoint("s1", &Cursor::new("100")).await.unwrap();
            store.commit("s1", &Cursor::new("100"), &Cursor::new("102")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.read_checkpoint("s1").await.unwrap().unwrap().cursor, Cursor::new("102"));
        assert_eq!(store.get_subscription("s1").await.unwrap().unwrap().provider_id, "gmail");
    }

    #[tokio::test]
    async fn two_handles_race_on_one_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("race.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();
        a.create_checkpoint("s1", &Cursor::new("100")).await.unwrap();

        a.commit("s1", &Cursor::new("100"), &Cursor::new("102")).await.unwrap();
        let loser = b.commit("s1", &Cursor::new("100"), &Cursor::new("102")).await;
        assert!(matches!(loser, Err(EngineError::CheckpointConflict(_))));
    }

    #[tokio::test]
    async fn reset_stamps_last_reset_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_checkpoint("s1", &Cursor::new("1")).await.unwrap();
        let reset = store.reset("s1", &Cursor::new("1"), &Cursor::new("5000")).await.unwrap();
        assert_eq!(reset.cursor, Cursor::new("5000"));
        assert!(reset.last_reset_at.is_some());
    }

    #[tokio::test]
    async fn find_live_skips_revoked() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_subscription(&subscription("a", SubscriptionStatus::Active)).await.unwrap();
        store.insert_subscription(&subscription("b", SubscriptionStatus::Revoked)).await.unwrap();
        let live = store.find_live("gmail", &ResourceScope::new("me").key()).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].subscription_id, "a");

        let mut a = live[0].clone();
        a.status = SubscriptionStatus::Revoked;
        let updated = store.update_subscription(&a).await.unwrap();
        assert_eq!(updated.version, 1);
        assert!(store.update_subscription(&a).await.is_err());
        assert!(store.find_live("gmail", &ResourceScope::new("me").key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credential_versions_advance() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cred = StoredCredential {
            subscription_id: "s1".to_string(),
            access_token: "a1".to_string(),
            refresh_token: Some("r1".to_string()),
            expires_at: Some(Utc::now()),
            version: 0,
        };
        let first = store.put_credential(&cred).await.unwrap();
        assert_eq!(first.version, 1);
        let swapped = store
            .swap_credential(1, &StoredCredential { access_token: "a2".to_string(), ..first.clone() })
            .await
            .unwrap();
        assert_eq!(swapped.version, 2);
        assert_eq!(swapped.access_token, "a2");
        assert!(matches!(store.swap_credential(1, &first).await, Err(EngineError::VersionConflict(_))));
    }

    #[tokio::test]
    async fn ledger_is_insert_once_until_expiry() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.record_if_new("k", Duration::from_secs(60)).await.unwrap());
        assert!(!store.record_if_new("k", Duration::from_secs(60)).await.unwrap());

        assert!(store.record_if_new("short", Duration::ZERO).await.unwrap());
        // zero retention is already expired on the next call
        assert!(store.record_if_new("short", Duration::from_secs(60)).await.unwrap());
    }
}
