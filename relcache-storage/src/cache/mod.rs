//! Cache layer: stores and the read-through cacher.
//!
//! Stores hold opaque bytes under rendered keys. The [`Cacher`] owns every
//! decision about what goes in them: key derivation, sentinel wrapping,
//! fetch on miss and cleaning.

pub mod cacher;
pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use cacher::{CallOutcome, Cacher};
pub use lmdb_backend::{LmdbStore, LmdbStoreError};
pub use memory::InMemoryStore;
pub use traits::{CacheStats, CacheStore};
