//! Cache store trait and usage statistics.
//!
//! A store is a flat key/value map with optional per-entry expiry. It knows
//! nothing about entities or sentinels: keys arrive rendered and values
//! arrive encoded by [`relcache_core::CachedValue`].

use std::time::Duration;

use async_trait::async_trait;
use relcache_core::StoreError;

/// Cache store trait for pluggable store implementations.
///
/// Implementations must be safe for concurrent use. Entries past their TTL
/// must read as missing.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get the bytes stored at `key`, or `None` when missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` at `key`, replacing any previous entry.
    ///
    /// `ttl = None` keeps the entry until it is deleted.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Delete the entry at `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Whether a live entry exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Get store statistics.
    async fn stats(&self) -> Result<CacheStats, StoreError>;
}

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of reads that found a live entry.
    pub hits: u64,
    /// Number of reads that found nothing.
    pub misses: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub memory_bytes: u64,
    /// Number of entries dropped because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
