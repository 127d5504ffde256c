//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Namespace prepended to every rendered key unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "relcache";

/// Configuration for the cacher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacherConfig {
    /// First segment of every store key.
    pub namespace: String,
    /// TTL handed to the store on every write. `None` leaves expiry to the store.
    pub default_ttl: Option<Duration>,
    /// Write associations the caller already loaded through to the store.
    pub cache_from_loaded_associations: bool,
}

impl Default for CacherConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_ttl: None,
            cache_from_loaded_associations: true,
        }
    }
}

impl CacherConfig {
    /// Create a new cacher config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the TTL applied to every write.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Enable or disable write-through of caller-loaded associations.
    pub fn with_cache_from_loaded_associations(mut self, enabled: bool) -> Self {
        self.cache_from_loaded_associations = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacherConfig::default();
        assert_eq!(config.namespace, "relcache");
        assert_eq!(config.default_ttl, None);
        assert!(config.cache_from_loaded_associations);
    }

    #[test]
    fn test_builder() {
        let config = CacherConfig::new()
            .with_namespace("active_model_cachers")
            .with_ttl(Duration::from_secs(1800))
            .with_cache_from_loaded_associations(false);

        assert_eq!(config.namespace, "active_model_cachers");
        assert_eq!(config.default_ttl, Some(Duration::from_secs(1800)));
        assert!(!config.cache_from_loaded_associations);
    }

    #[test]
    fn test_deserializes_from_json() {
        let config: CacherConfig = serde_json::from_str(
            r#"{"namespace":"app","default_ttl":{"secs":60,"nanos":0},"cache_from_loaded_associations":true}"#,
        )
        .unwrap();
        assert_eq!(config.namespace, "app");
        assert_eq!(config.default_ttl, Some(Duration::from_secs(60)));
    }
}
