//! Error types for relcache operations

use thiserror::Error;

/// Registration and resolution errors.
///
/// Raised while building a [`crate::Registry`] and when a caller names an
/// attribute the registry does not know. Registration errors are fatal: a
/// registry that fails to build must not be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Entity declared twice: {entity}")]
    DuplicateEntity { entity: String },

    #[error("Unknown entity: {entity}")]
    UnknownEntity { entity: String },

    #[error("Unknown attribute {attribute} on {entity}")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("Attribute {attribute} on {entity} collides with an existing {existing}")]
    AttributeCollision {
        entity: String,
        attribute: String,
        existing: String,
    },

    #[error("Column {column} is not declared on {entity}")]
    UndeclaredColumn { entity: String, column: String },

    #[error("Relation {relation} on {entity} targets undeclared entity {target}")]
    UndeclaredTarget {
        entity: String,
        relation: String,
        target: String,
    },

    #[error("Attribute {attribute} on {entity} expires by undeclared {dependency}")]
    UndeclaredDependency {
        entity: String,
        attribute: String,
        dependency: String,
    },

    #[error("Attribute {attribute} on {entity} cannot map {dependency} changes to an identifier")]
    UnmappableDependency {
        entity: String,
        attribute: String,
        dependency: String,
    },

    #[error("Relation {relation} on {entity} has an unsupported join: {reason}")]
    UnsupportedJoin {
        entity: String,
        relation: String,
        reason: String,
    },

    #[error("Attribute {attribute} on {entity} requires an identifier")]
    MissingIdentifier { entity: String, attribute: String },
}

/// Errors raised by a persistence collaborator.
///
/// The cacher never retries these: nothing was cached, so the next call is
/// the retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Query on {entity} failed: {reason}")]
    QueryFailed { entity: String, reason: String },

    #[error("Unknown table for entity {entity}")]
    UnknownTable { entity: String },

    #[error("Persistence unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cache store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache entry at {key} could not be decoded: {reason}")]
    Codec { key: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Master error type for all relcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelcacheError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for relcache operations.
pub type RelcacheResult<T> = Result<T, RelcacheError>;

// =============================================================================
// TESTS
// =============================================================================
