//! RELCACHE Storage - Cache Stores, Cacher and Mutation Hooks
//!
//! The I/O half of relcache. Stores hold encoded entries, the cacher reads
//! through them and the hooks clean them after a committed write.
//! [`persistence::InMemoryPersistence`] is the reference adapter used in
//! tests; real deployments implement [`relcache_core::Persistence`] over
//! their own database.

pub mod cache;
pub mod hooks;
pub mod persistence;

pub use cache::{
    CacheStats, CacheStore, Cacher, CallOutcome, InMemoryStore, LmdbStore, LmdbStoreError,
};
pub use hooks::{Invalidation, Mutation, MutationHooks, PendingMutation};
pub use persistence::{InMemoryPersistence, QueryKind, QueryLogEntry};
