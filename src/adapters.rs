//! Adapter interfaces consumed from external collaborators (§6):
//! `SecretStore`, `KeyValueAdapter`, `Clock`. The core never knows which
//! platform keystore or storage engine is behind these — it only sees the
//! trait.
//!
//! Two production-shaped implementations ship here: a SQLite-backed
//! `KeyValueAdapter` (the only persistence this crate touches directly,
//! namespaced the way the teacher's read-model tables are) and an
//! in-memory one for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is full")]
    Full,
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn delete(&self, name: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait KeyValueAdapter: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;
    async fn iterate(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// Injectable wall clock, so tests can control `now_ms()` deterministically
/// (e.g. to exercise backoff schedules and reassembly timeouts).
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64
    }
}

/// A clock pinned to a fixed value, advanced explicitly by tests.
pub struct FixedClock {
    now_ms: std::sync::atomic::AtomicU64,
}

impl FixedClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: std::sync::atomic::AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms
            .fetch_add(delta_ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// SQLite-backed `KeyValueAdapter`, namespaced `(namespace, key)` rows in a
/// single table — the same `CREATE TABLE IF NOT EXISTS` migration style the
/// read-model schema uses, reduced to the generic shape this crate needs.
pub struct SqliteKeyValueAdapter {
    pool: SqlitePool,
}

impl SqliteKeyValueAdapter {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePool::connect(database_url).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                namespace   TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       BLOB NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueAdapter for SqliteKeyValueAdapter {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_store (namespace, key, value) VALUES (?, ?, ?)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn iterate(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let rows = sqlx::query("SELECT key, value FROM kv_store WHERE namespace = ?")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}

/// In-memory `KeyValueAdapter` for tests and the in-process simulation
/// harness.
#[derive(Default)]
pub struct InMemoryKeyValueAdapter {
    data: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryKeyValueAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KeyValueAdapter for InMemoryKeyValueAdapter {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn iterate(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// In-memory `SecretStore` for tests; a host app supplies a platform
/// keystore-backed implementation in production.
#[derive(Default)]
pub struct InMemorySecretStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.data.write().await.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(name).cloned())
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(name);
        Ok(())
    }
}
