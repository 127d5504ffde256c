//! Mutation lifecycle hooks.
//!
//! Each record mutation runs as a pair: a `before_*` call while the old row
//! still exists, then [`MutationHooks::after_commit`] once the change is
//! durable. The before phase snapshots what the after phase can no longer
//! see; the after phase diffs old against new and cleans every stale key.
//!
//! # Example
//!
//! ```ignore
//! let pending = hooks.before_update("Post", &post).await?;
//! db.update(...)?;
//! let report = hooks.after_commit(pending, Some(&updated)).await?;
//! ```

pub mod scope;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};

use relcache_core::{
    CacheKey, Identifier, InvalidationScope, LifecycleEvent, Persistence, Record, RelcacheResult,
};
use tracing::debug;

use crate::cache::{CacheStore, Cacher};
use scope::{KeyResolver, KeySet};

/// Kind of record mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    Create,
    Update,
    /// Destroy of a loaded record.
    Destroy,
    /// Delete by primary key, without a loaded record.
    Delete,
}

impl Mutation {
    pub fn lifecycle(self) -> LifecycleEvent {
        match self {
            Self::Create => LifecycleEvent::Create,
            Self::Update => LifecycleEvent::Update,
            Self::Destroy | Self::Delete => LifecycleEvent::Destroy,
        }
    }

    fn removes_row(self) -> bool {
        matches!(self, Self::Destroy | Self::Delete)
    }
}

/// State carried from the before phase to the after phase.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    entity: String,
    mutation: Mutation,
    before: Option<Record>,
    /// Resolved up front when the row (and rows pointing at it) may be
    /// gone by the after phase.
    planned: Option<(BTreeSet<String>, KeySet)>,
}

impl PendingMutation {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn mutation(&self) -> Mutation {
        self.mutation
    }

    /// Tracked columns of the row before the change.
    pub fn before(&self) -> Option<&Record> {
        self.before.as_ref()
    }
}

/// What one mutation invalidated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Columns the mutation touched.
    pub changed: BTreeSet<String>,
    /// Every cleaned key and the scope that produced it.
    pub keys: BTreeMap<CacheKey, InvalidationScope>,
    /// How many of those keys held a live entry.
    pub removed: usize,
}

impl Invalidation {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn in_scope(&self, scope: InvalidationScope) -> impl Iterator<Item = &CacheKey> {
        self.keys
            .iter()
            .filter(move |(_, s)| **s == scope)
            .map(|(k, _)| k)
    }
}

/// Invalidation hooks bound to a cacher.
pub struct MutationHooks<S, P>
where
    S: CacheStore,
    P: Persistence,
{
    cacher: Cacher<S, P>,
}

impl<S, P> MutationHooks<S, P>
where
    S: CacheStore,
    P: Persistence,
{
    pub fn new(cacher: Cacher<S, P>) -> Self {
        Self { cacher }
    }

    pub fn cacher(&self) -> &Cacher<S, P> {
        &self.cacher
    }

    fn resolver(&self) -> KeyResolver<'_> {
        KeyResolver::new(self.cacher.persistence(), self.cacher.registry())
    }

    pub async fn before_create(&self, entity: &str) -> RelcacheResult<PendingMutation> {
        let descriptor = self.cacher.registry().require(entity)?;
        Ok(PendingMutation {
            entity: descriptor.name().to_string(),
            mutation: Mutation::Create,
            before: None,
            planned: None,
        })
    }

    /// `record` is the row as loaded before the change; missing tracked
    /// columns cost one projection query.
    pub async fn before_update(
        &self,
        entity: &str,
        record: &Record,
    ) -> RelcacheResult<PendingMutation> {
        self.before(entity, Mutation::Update, Some(record), None)
            .await
    }

    pub async fn before_destroy(
        &self,
        entity: &str,
        record: &Record,
    ) -> RelcacheResult<PendingMutation> {
        self.before(entity, Mutation::Destroy, Some(record), None)
            .await
    }

    /// Instance-less delete: the row is loaded by primary key.
    pub async fn before_delete(
        &self,
        entity: &str,
        id: &Identifier,
    ) -> RelcacheResult<PendingMutation> {
        self.before(entity, Mutation::Delete, None, Some(id)).await
    }

    async fn before(
        &self,
        entity: &str,
        mutation: Mutation,
        record: Option<&Record>,
        id: Option<&Identifier>,
    ) -> RelcacheResult<PendingMutation> {
        let registry = self.cacher.registry();
        let descriptor = registry.require(entity)?;
        let before = snapshot::capture(
            self.cacher.persistence(),
            registry,
            descriptor,
            record,
            id,
        )
        .await?;

        let planned = if mutation.removes_row() {
            let changed = scope::changed_columns(mutation, before.as_ref(), None);
            let keys = self
                .resolver()
                .resolve(
                    descriptor,
                    mutation.lifecycle(),
                    &changed,
                    before.as_ref(),
                    None,
                )
                .await?;
            Some((changed, keys))
        } else {
            None
        };

        Ok(PendingMutation {
            entity: descriptor.name().to_string(),
            mutation,
            before,
            planned,
        })
    }

    /// Clean every key the committed mutation staled.
    ///
    /// `after` is the row as persisted; `None` for destroy and delete. A
    /// create or update without an `after` row is taken as not having
    /// happened.
    pub async fn after_commit(
        &self,
        pending: PendingMutation,
        after: Option<&Record>,
    ) -> RelcacheResult<Invalidation> {
        let (changed, keys) = match pending.planned {
            Some(planned) => planned,
            None => {
                let Some(after) = after else {
                    return Ok(Invalidation::default());
                };
                let registry = self.cacher.registry();
                let descriptor = registry.require(&pending.entity)?;
                let changed =
                    scope::changed_columns(pending.mutation, pending.before.as_ref(), Some(after));
                if changed.is_empty() {
                    debug!(entity = %pending.entity, "update changed nothing");
                    return Ok(Invalidation::default());
                }

                let mut current = pending.before.clone().unwrap_or_default();
                current.merge(after);
                let keys = self
                    .resolver()
                    .resolve(
                        descriptor,
                        pending.mutation.lifecycle(),
                        &changed,
                        pending.before.as_ref(),
                        Some(&current),
                    )
                    .await?;
                (changed, keys)
            }
        };

        debug!(
            entity = %pending.entity,
            mutation = ?pending.mutation,
            keys = keys.len(),
            "invalidating"
        );
        let mut removed = 0;
        for key in keys.keys() {
            if self.cacher.clean_key(key).await? {
                removed += 1;
            }
        }

        Ok(Invalidation {
            changed,
            keys,
            removed,
        })
    }
}
