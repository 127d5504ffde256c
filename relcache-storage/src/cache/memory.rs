//! In-process cache store.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relcache_core::StoreError;

use super::traits::{CacheStats, CacheStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// HashMap-backed store for tests and single-process deployments.
///
/// Expired entries are dropped lazily on the next access to their key.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    stats: RwLock<CacheStats>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered keys of every live entry, sorted.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .clear();
        if let Ok(mut stats) = self.stats.write() {
            stats.entry_count = 0;
            stats.memory_bytes = 0;
        }
        Ok(())
    }

    fn record(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Remove `key` if its TTL has passed. Returns the live entry, if any.
    fn live_entry(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
            match entries.get(key) {
                Some(e) if e.is_live(now) => return Ok(Some(e.clone())),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            return self.evict_expired(key, now);
        }
        Ok(None)
    }

    /// Remove `key` only if it is still expired at `now`; an entry written
    /// after the read check is kept and returned.
    fn evict_expired(&self, key: &str, now: Instant) -> Result<Option<Entry>, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.clone())),
            Some(_) => {
                if let Some(expired) = entries.remove(key) {
                    self.record(|s| {
                        s.expirations += 1;
                        s.entry_count = s.entry_count.saturating_sub(1);
                        s.memory_bytes = s.memory_bytes.saturating_sub(expired.value.len() as u64);
                    });
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.live_entry(key)? {
            Some(entry) => {
                self.record(|s| s.hits += 1);
                Ok(Some(entry.value))
            }
            None => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let size = value.len() as u64;
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        let previous = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(key.to_string(), entry);
        self.record(|s| {
            match previous {
                Some(old) => s.memory_bytes = s.memory_bytes.saturating_sub(old.value.len() as u64),
                None => s.entry_count += 1,
            }
            s.memory_bytes += size;
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(key);
        Ok(match removed {
            Some(entry) => {
                self.record(|s| {
                    s.entry_count = s.entry_count.saturating_sub(1);
                    s.memory_bytes = s.memory_bytes.saturating_sub(entry.value.len() as u64);
                });
                entry.is_live(now)
            }
            None => false,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_entry(key)?.is_some())
    }

    async fn stats(&self) -> Result<CacheStats, StoreError> {
        self.stats
            .read()
            .map(|s| s.clone())
            .map_err(|_| StoreError::LockPoisoned)
    }
}
