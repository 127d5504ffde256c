//! RELCACHE Core - Entity Metadata and Cache Keys
//!
//! Pure data structures shared by the cacher and the mutation hooks:
//! descriptors, keys, sentinels, the dependency index and the persistence
//! seam. No store and no I/O live here.

pub mod config;
pub mod dependency;
pub mod entity;
pub mod error;
pub mod identity;
pub mod key;
pub mod persistence;
pub mod registry;
pub mod value;

pub use config::{CacherConfig, DEFAULT_NAMESPACE};
pub use dependency::{Dependent, Identity, InvalidationScope, OwnerLookup, Sensitivity};
pub use entity::{
    AttributeDescriptor, AttributeKind, AttributeMethod, Cardinality, ComputedDescriptor,
    Dependency, DependencySource, EntityDescriptor, ForeignKeySide, JoinDescriptor,
    LifecycleEvent, RelationDescriptor, CLEAN_PREFIX,
};
pub use error::{ConfigError, FetchError, RelcacheError, RelcacheResult, StoreError};
pub use identity::{Identifier, Instance, Record};
pub use key::{CacheKey, KeySegment};
pub use persistence::{
    filter, values_equal, AttributeComputer, ComputeContext, CountWhere, ExistsWhere, Filters,
    Persistence, Predicate,
};
pub use registry::{
    snake_case, ComputedSpec, EntityBuilder, Registry, RegistryBuilder, RelationSpec,
    DEFAULT_PRIMARY_KEY,
};
pub use value::CachedValue;
