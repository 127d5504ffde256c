//! LMDB-backed cache store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep cache entries in a
//! memory-mapped file shared by every process that opens the same directory.
//!
//! # Entry Layout
//!
//! `[expires_at: i64 LE millis, 0 = never][payload]`. Expired entries read as
//! missing and are removed on the next access to their key.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `get` and `exists`
//! - Write transactions for `set`, `delete` and lazy expiry
//! - Statistics are kept behind an `RwLock`

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use relcache_core::StoreError;

use super::traits::{CacheStats, CacheStore};

const HEADER_LEN: usize = 8;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored entry is shorter than its header.
    #[error("Corrupt entry at {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Corrupt(key) => StoreError::Codec {
                key,
                reason: "entry shorter than its expiry header".to_string(),
            },
            other => StoreError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// LMDB-backed cache store.
///
/// # Example
///
/// ```ignore
/// use relcache_storage::cache::LmdbStore;
///
/// let store = LmdbStore::new("/var/cache/relcache", 100)?;
/// store.set("relcache_User_1", bytes, None).await?;
/// ```
pub struct LmdbStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    stats: RwLock<CacheStats>,
}

impl LmdbStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per store and never with
        // conflicting flags from this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        Ok(Self {
            env,
            db,
            stats: RwLock::new(CacheStats::default()),
        })
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    fn encode(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
        let expires_at = ttl
            .map(|t| {
                let ttl = i64::try_from(t.as_millis()).unwrap_or(i64::MAX);
                Utc::now().timestamp_millis().saturating_add(ttl)
            })
            .unwrap_or(0);
        let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
        bytes.extend_from_slice(&expires_at.to_le_bytes());
        bytes.extend_from_slice(value);
        bytes
    }

    /// Split a stored entry into (expired, payload).
    fn decode<'a>(key: &str, bytes: &'a [u8]) -> Result<(bool, &'a [u8]), LmdbStoreError> {
        let header: [u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| LmdbStoreError::Corrupt(key.to_string()))?;
        let expires_at = i64::from_le_bytes(header);
        let expired = expires_at != 0 && expires_at <= Utc::now().timestamp_millis();
        Ok((expired, &bytes[HEADER_LEN..]))
    }

    /// Read the live payload at `key`, dropping it if expired.
    fn read_live(&self, key: &str) -> Result<Option<Vec<u8>>, LmdbStoreError> {
        let expired = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            match self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)? {
                None => return Ok(None),
                Some(bytes) => {
                    let (expired, payload) = Self::decode(key, bytes)?;
                    if !expired {
                        return Ok(Some(payload.to_vec()));
                    }
                    expired
                }
            }
        };

        if expired && self.remove(key)?.is_some() {
            self.record(|s| {
                s.expirations += 1;
                s.entry_count = s.entry_count.saturating_sub(1);
            });
        }
        Ok(None)
    }

    /// Delete `key`, returning the removed entry's size.
    fn remove(&self, key: &str) -> Result<Option<usize>, LmdbStoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let size = self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(txn_error)?
            .map(<[u8]>::len);
        if size.is_some() {
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(size)
    }
}

#[async_trait]
impl CacheStore for LmdbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.read_live(key)?;
        let hit = value.is_some();
        self.record(|s| {
            if hit {
                s.hits += 1;
            } else {
                s.misses += 1;
            }
        });
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let bytes = Self::encode(&value, ttl);

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let is_new = self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(txn_error)?
            .is_none();
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;

        self.record(|s| {
            if is_new {
                s.entry_count += 1;
            }
            s.memory_bytes += value.len() as u64;
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let live = self.read_live(key)?.is_some();
        if let Some(size) = self.remove(key)? {
            self.record(|s| {
                s.entry_count = s.entry_count.saturating_sub(1);
                s.memory_bytes = s
                    .memory_bytes
                    .saturating_sub(size.saturating_sub(HEADER_LEN) as u64);
            });
        }
        Ok(live)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read_live(key)?.is_some())
    }

    async fn stats(&self) -> Result<CacheStats, StoreError> {
        self.stats
            .read()
            .map(|s| s.clone())
            .map_err(|_| StoreError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbStore::new(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _temp_dir) = create_test_store();

        store
            .set("relcache_User_1", b"{\"t\":\"nil\"}".to_vec(), None)
            .await
            .expect("set should succeed");

        let cached = store.get("relcache_User_1").await.expect("get should succeed");
        assert_eq!(cached, Some(b"{\"t\":\"nil\"}".to_vec()));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _temp_dir) = create_test_store();
        let cached = store.get("relcache_User_404").await.expect("get should succeed");
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp_dir) = create_test_store();

        store
            .set("relcache_User_at_posts_1", b"[]".to_vec(), None)
            .await
            .expect("set should succeed");
        assert!(store
            .delete("relcache_User_at_posts_1")
            .await
            .expect("delete should succeed"));
        assert!(!store
            .exists("relcache_User_at_posts_1")
            .await
            .expect("exists should succeed"));
        assert!(!store
            .delete("relcache_User_at_posts_1")
            .await
            .expect("delete should succeed"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_missing() {
        let (store, _temp_dir) = create_test_store();

        store
            .set("k", b"v".to_vec(), Some(Duration::ZERO))
            .await
            .expect("set should succeed");
        assert!(store.get("k").await.expect("get should succeed").is_none());

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (store, _temp_dir) = create_test_store();

        store.set("k", b"old".to_vec(), None).await.expect("set should succeed");
        store.set("k", b"new".to_vec(), None).await.expect("set should succeed");

        assert_eq!(
            store.get("k").await.expect("get should succeed"),
            Some(b"new".to_vec())
        );
        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _temp_dir) = create_test_store();

        let _ = store.get("k").await;
        store.set("k", b"v".to_vec(), None).await.expect("set should succeed");
        let _ = store.get("k").await;
        let _ = store.get("k").await;

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let store = LmdbStore::new(temp_dir.path(), 10).expect("store creation should succeed");
            store.set("k", b"v".to_vec(), None).await.expect("set should succeed");
        }
        let store = LmdbStore::new(temp_dir.path(), 10).expect("store creation should succeed");
        assert_eq!(
            store.get("k").await.expect("get should succeed"),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn test_huge_ttl_saturates_instead_of_wrapping() {
        let bytes = LmdbStore::encode(b"v", Some(Duration::MAX));
        let header: [u8; HEADER_LEN] = bytes[..HEADER_LEN].try_into().unwrap();
        assert_eq!(i64::from_le_bytes(header), i64::MAX);

        let (expired, payload) = LmdbStore::decode("k", &bytes).unwrap();
        assert!(!expired);
        assert_eq!(payload, b"v");
    }

    #[test]
    fn test_corrupt_entry_is_codec_error() {
        let err: StoreError = LmdbStoreError::Corrupt("k".into()).into();
        assert!(matches!(err, StoreError::Codec { .. }));
    }
}
