//! Change detection and dependent key resolution.

use std::collections::{BTreeMap, BTreeSet};

use relcache_core::{
    filter, values_equal, CacheKey, Dependent, EntityDescriptor, Filters, Identifier, Identity,
    InvalidationScope, LifecycleEvent, OwnerLookup, Persistence, Record, Registry,
    RelcacheResult,
};
use serde_json::Value;
use tracing::trace;

use super::Mutation;

/// Keys to clean, each with the scope that produced it.
pub type KeySet = BTreeMap<CacheKey, InvalidationScope>;

/// Columns a mutation touched.
///
/// Update: columns of `after` whose value differs from `before` (a column
/// missing from `before` counts as changed). Create: non-null columns of
/// `after`. Destroy and delete: non-null columns of `before`.
pub fn changed_columns(
    mutation: Mutation,
    before: Option<&Record>,
    after: Option<&Record>,
) -> BTreeSet<String> {
    let present = |r: Option<&Record>| -> BTreeSet<String> {
        r.map(|r| r.present_columns().map(str::to_string).collect())
            .unwrap_or_default()
    };
    match mutation {
        Mutation::Create => present(after),
        Mutation::Destroy | Mutation::Delete => present(before),
        Mutation::Update => {
            let Some(after) = after else {
                return BTreeSet::new();
            };
            after
                .columns()
                .filter(|column| {
                    let new = after.get(column);
                    match (before.and_then(|b| b.get(column)), new) {
                        (Some(old), Some(new)) => !values_equal(old, new),
                        _ => true,
                    }
                })
                .map(str::to_string)
                .collect()
        }
    }
}

fn identifiers_in<'r>(
    records: impl IntoIterator<Item = &'r Record>,
    column: &str,
) -> BTreeSet<Identifier> {
    records
        .into_iter()
        .filter_map(|r| r.identifier(column))
        .collect()
}

/// Equality filter for one identifier, membership for several.
fn filter_in(column: &str, ids: &BTreeSet<Identifier>) -> Filters {
    let mut values: Vec<Value> = ids.iter().map(|id| id.value().clone()).collect();
    if values.len() == 1 {
        filter(column, values.remove(0))
    } else {
        filter(column, Value::Array(values))
    }
}

/// Resolves dependents of a mutated row to concrete cache keys.
pub struct KeyResolver<'a> {
    persistence: &'a dyn Persistence,
    registry: &'a Registry,
}

impl<'a> KeyResolver<'a> {
    pub fn new(persistence: &'a dyn Persistence, registry: &'a Registry) -> Self {
        Self {
            persistence,
            registry,
        }
    }

    /// Every key a mutation of `entity` stales.
    ///
    /// `before` is the row as it was, `current` the row as it is now; both
    /// old and new identity values are covered.
    pub async fn resolve(
        &self,
        entity: &EntityDescriptor,
        event: LifecycleEvent,
        changed: &BTreeSet<String>,
        before: Option<&Record>,
        current: Option<&Record>,
    ) -> RelcacheResult<KeySet> {
        let mut keys = KeySet::new();
        for dependent in self.registry.dependents_of(entity.name()) {
            if !dependent.triggers.contains(&event) {
                trace!(owner = %dependent.owner, segment = ?dependent.segment, ?event, "dependent not triggered");
                continue;
            }
            if !dependent.sensitivity.is_stale(changed) {
                trace!(owner = %dependent.owner, segment = ?dependent.segment, "dependent not sensitive to change");
                continue;
            }

            match self.identifiers(dependent, before, current).await? {
                None => {
                    let key = CacheKey::new(dependent.owner.clone(), dependent.segment.clone(), None);
                    keys.insert(key, dependent.scope);
                }
                Some(ids) => {
                    for id in ids {
                        let key = CacheKey::new(
                            dependent.owner.clone(),
                            dependent.segment.clone(),
                            Some(id),
                        );
                        keys.insert(key, dependent.scope);
                    }
                }
            }
        }
        Ok(keys)
    }

    /// `None` for identifier-less keys.
    async fn identifiers(
        &self,
        dependent: &Dependent,
        before: Option<&Record>,
        current: Option<&Record>,
    ) -> RelcacheResult<Option<BTreeSet<Identifier>>> {
        let rows = || before.into_iter().chain(current);
        let ids = match &dependent.identity {
            Identity::Global => return Ok(None),
            Identity::Column(column) => identifiers_in(rows(), column),
            Identity::Lookup { lookup, key_column } => {
                let start = identifiers_in(rows(), lookup.column());
                self.follow(&dependent.owner, lookup, key_column, start)
                    .await?
            }
        };
        Ok(Some(ids))
    }

    async fn follow(
        &self,
        owner: &str,
        lookup: &OwnerLookup,
        key_column: &str,
        start: BTreeSet<Identifier>,
    ) -> RelcacheResult<BTreeSet<Identifier>> {
        match lookup {
            OwnerLookup::Referenced { owner_column, .. } => {
                self.owner_keys(owner, owner_column, key_column, start).await
            }
            OwnerLookup::Referencing { owner_fk, .. } => {
                self.owner_keys(owner, owner_fk, key_column, start).await
            }
            OwnerLookup::Joined {
                join_entity,
                join_target_key,
                join_owner_key,
                owner_column,
                ..
            } => {
                if start.is_empty() {
                    return Ok(start);
                }
                let join = self.registry.require(join_entity)?;
                let links = self
                    .persistence
                    .find_by_columns(
                        join,
                        &filter_in(join_target_key, &start),
                        Some(std::slice::from_ref(join_owner_key)),
                    )
                    .await?;
                let owners = identifiers_in(&links, join_owner_key);
                self.owner_keys(owner, owner_column, key_column, owners).await
            }
        }
    }

    /// `key_column` values of `owner` rows whose `match_column` is in `values`.
    async fn owner_keys(
        &self,
        owner: &str,
        match_column: &str,
        key_column: &str,
        values: BTreeSet<Identifier>,
    ) -> RelcacheResult<BTreeSet<Identifier>> {
        if values.is_empty() || match_column == key_column {
            return Ok(values);
        }
        let owner = self.registry.require(owner)?;
        let rows = self
            .persistence
            .find_by_columns(
                owner,
                &filter_in(match_column, &values),
                Some(&[key_column.to_string()]),
            )
            .await?;
        Ok(identifiers_in(&rows, key_column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(set: BTreeSet<String>) -> Vec<String> {
        set.into_iter().collect()
    }

    #[test]
    fn test_update_diff_ignores_unchanged_columns() {
        let before = Record::new().with("id", 1).with("title", "a").with("user_id", 1);
        let after = Record::new().with("id", 1).with("title", "b").with("user_id", 1);
        assert_eq!(
            names(changed_columns(Mutation::Update, Some(&before), Some(&after))),
            vec!["title"]
        );
    }

    #[test]
    fn test_update_with_identical_record_changes_nothing() {
        let row = Record::new().with("id", 1).with("title", "a");
        assert!(changed_columns(Mutation::Update, Some(&row), Some(&row)).is_empty());
    }

    #[test]
    fn test_numeric_representation_is_not_a_change() {
        let before = Record::new().with("id", 1).with("point", json!(3));
        let after = Record::new().with("id", 1).with("point", json!(3.0));
        assert!(changed_columns(Mutation::Update, Some(&before), Some(&after)).is_empty());
    }

    #[test]
    fn test_create_and_destroy_use_non_null_columns() {
        let row = Record::new()
            .with("id", 1)
            .with("user_id", Value::Null)
            .with("title", "a");
        assert_eq!(
            names(changed_columns(Mutation::Create, None, Some(&row))),
            vec!["id", "title"]
        );
        assert_eq!(
            names(changed_columns(Mutation::Delete, Some(&row), None)),
            vec!["id", "title"]
        );
    }

    #[test]
    fn test_filter_in_shapes() {
        let one: BTreeSet<_> = [Identifier::from(1)].into_iter().collect();
        assert_eq!(filter_in("id", &one)["id"], json!(1));
        let two: BTreeSet<_> = [Identifier::from(1), Identifier::from(2)]
            .into_iter()
            .collect();
        assert!(filter_in("id", &two)["id"].is_array());
    }
}
