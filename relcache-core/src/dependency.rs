//! Dependency index: which cache keys a mutation of each entity may touch.
//!
//! Built once from the resolved descriptors. For every entity `M` the index
//! holds the list of [`Dependent`] rules whose keys a create, update or
//! destroy of an `M` row can stale, and the set of `M` columns the mutation
//! hooks must know before the row changes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::entity::{
    AttributeKind, DependencySource, EntityDescriptor, LifecycleEvent, RelationDescriptor,
};
use crate::error::ConfigError;
use crate::key::KeySegment;

/// Classification of an invalidated key relative to the mutated row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InvalidationScope {
    /// The mutated record's own entries.
    Own,
    /// Entries of records related to the mutated one.
    Forward,
    /// Identifier-independent aggregates.
    Global,
}

/// Which changed columns stale a dependent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sensitivity {
    AnyColumn,
    Columns(BTreeSet<String>),
}

impl Sensitivity {
    fn from_columns(columns: Option<&BTreeSet<String>>) -> Self {
        match columns {
            Some(c) => Self::Columns(c.clone()),
            None => Self::AnyColumn,
        }
    }

    /// Whether a mutation that touched `changed` stales the dependent.
    pub fn is_stale(&self, changed: &BTreeSet<String>) -> bool {
        match self {
            Self::AnyColumn => !changed.is_empty(),
            Self::Columns(columns) => !columns.is_disjoint(changed),
        }
    }
}

/// How to reach owner rows from a mutated row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerLookup {
    /// The mutated row's `column` holds the owner's `owner_column` value.
    Referenced { column: String, owner_column: String },
    /// The owner's `owner_fk` holds the mutated row's `column` value.
    Referencing { column: String, owner_fk: String },
    /// A join row links them: `join_target_key` holds the mutated row's
    /// `column` value, `join_owner_key` the owner's `owner_column` value.
    Joined {
        column: String,
        join_entity: String,
        join_target_key: String,
        join_owner_key: String,
        owner_column: String,
    },
}

impl OwnerLookup {
    /// Column of the mutated row the lookup starts from.
    pub fn column(&self) -> &str {
        match self {
            Self::Referenced { column, .. }
            | Self::Referencing { column, .. }
            | Self::Joined { column, .. } => column,
        }
    }
}

/// How a dependent key's identifier is derived from the mutated row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// No identifier.
    Global,
    /// The mutated row's own column value.
    Column(String),
    /// Values of the owner's `key_column` on rows reached by `lookup`.
    Lookup {
        lookup: OwnerLookup,
        key_column: String,
    },
}

/// One invalidation rule attached to a mutated entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    /// Entity whose key is invalidated.
    pub owner: String,
    pub segment: KeySegment,
    pub scope: InvalidationScope,
    pub sensitivity: Sensitivity,
    pub triggers: BTreeSet<LifecycleEvent>,
    pub identity: Identity,
}

impl Dependent {
    /// Columns of the mutated row this rule reads.
    fn columns_read(&self) -> impl Iterator<Item = &str> {
        let identity = match &self.identity {
            Identity::Global => None,
            Identity::Column(c) => Some(c.as_str()),
            Identity::Lookup { lookup, .. } => Some(lookup.column()),
        };
        let sensitive = match &self.sensitivity {
            Sensitivity::AnyColumn => None,
            Sensitivity::Columns(c) => Some(c.iter().map(String::as_str)),
        };
        identity.into_iter().chain(sensitive.into_iter().flatten())
    }
}

/// Per-entity dependents and tracked columns.
#[derive(Debug, Default)]
pub(crate) struct DependencyIndex {
    pub(crate) dependents: HashMap<String, Vec<Dependent>>,
    pub(crate) tracked: HashMap<String, BTreeSet<String>>,
}

impl DependencyIndex {
    pub(crate) fn build(
        entities: &BTreeMap<String, EntityDescriptor>,
    ) -> Result<Self, ConfigError> {
        let mut index = DependencyIndex::default();
        for entity in entities.values() {
            index.add_entity(entity, entities)?;
        }
        for entity in entities.values() {
            let mut tracked: BTreeSet<String> = BTreeSet::new();
            tracked.insert(entity.primary_key.clone());
            for dependent in index.dependents.get(&entity.name).into_iter().flatten() {
                tracked.extend(dependent.columns_read().map(str::to_string));
            }
            index.tracked.insert(entity.name.clone(), tracked);
        }
        Ok(index)
    }

    fn push(&mut self, mutated: &str, dependent: Dependent) {
        let list = self.dependents.entry(mutated.to_string()).or_default();
        if !list.contains(&dependent) {
            list.push(dependent);
        }
    }

    fn add_entity(
        &mut self,
        entity: &EntityDescriptor,
        entities: &BTreeMap<String, EntityDescriptor>,
    ) -> Result<(), ConfigError> {
        let pk = entity.primary_key.clone();
        let own = |segment: KeySegment, sensitivity: Sensitivity, column: &str| Dependent {
            owner: entity.name.clone(),
            segment,
            scope: InvalidationScope::Own,
            sensitivity,
            triggers: LifecycleEvent::all(),
            identity: Identity::Column(column.to_string()),
        };

        self.push(&entity.name, own(KeySegment::Record, Sensitivity::AnyColumn, &pk));
        for column in &entity.lookup_columns {
            self.push(
                &entity.name,
                own(
                    KeySegment::RecordBy(column.clone()),
                    Sensitivity::AnyColumn,
                    column,
                ),
            );
        }

        for attribute in entity.attributes.values() {
            let segment = attribute.key_segment();
            match &attribute.kind {
                AttributeKind::Column { column } => {
                    let columns = BTreeSet::from([column.clone()]);
                    self.push(
                        &entity.name,
                        own(segment, Sensitivity::Columns(columns), &pk),
                    );
                }
                AttributeKind::ToOne(relation) | AttributeKind::ToMany(relation) => {
                    self.add_relation(entity, segment, relation);
                }
                AttributeKind::Computed(computed) => {
                    let key_column = computed.identifier_column.as_deref();
                    for dependency in &computed.expire_by {
                        let sensitivity = Sensitivity::from_columns(dependency.columns.as_ref());
                        let base = Dependent {
                            owner: entity.name.clone(),
                            segment: segment.clone(),
                            scope: InvalidationScope::Own,
                            sensitivity,
                            triggers: computed.triggers.clone(),
                            identity: Identity::Global,
                        };
                        match &dependency.source {
                            DependencySource::Entity(source) => {
                                let dependent = match key_column {
                                    None => Dependent {
                                        scope: InvalidationScope::Global,
                                        ..base
                                    },
                                    Some(k) if *source == entity.name => Dependent {
                                        identity: Identity::Column(k.to_string()),
                                        ..base
                                    },
                                    Some(_) => {
                                        return Err(ConfigError::UnmappableDependency {
                                            entity: entity.name.clone(),
                                            attribute: attribute.name.clone(),
                                            dependency: source.clone(),
                                        })
                                    }
                                };
                                self.push(source, dependent);
                            }
                            DependencySource::Relation(name) => {
                                let relation = entity.relation(name)?;
                                let target = entities.get(&relation.target).ok_or_else(|| {
                                    ConfigError::UndeclaredTarget {
                                        entity: entity.name.clone(),
                                        relation: name.clone(),
                                        target: relation.target.clone(),
                                    }
                                })?;
                                self.add_relation_dependency(target, relation, key_column, base);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Keys of relation attributes: stale on FK change of the declaring row
    /// (owning side) or on any change of a related row (owned / joined).
    fn add_relation(
        &mut self,
        entity: &EntityDescriptor,
        segment: KeySegment,
        relation: &RelationDescriptor,
    ) {
        let pk = entity.primary_key.clone();
        if relation.is_owning() {
            self.push(
                &entity.name,
                Dependent {
                    owner: entity.name.clone(),
                    segment,
                    scope: InvalidationScope::Own,
                    sensitivity: Sensitivity::Columns(BTreeSet::from([
                        relation.local_key.clone()
                    ])),
                    triggers: LifecycleEvent::all(),
                    identity: Identity::Column(pk),
                },
            );
            return;
        }

        // The declaring row going away stales whatever it cached.
        self.push(
            &entity.name,
            Dependent {
                owner: entity.name.clone(),
                segment: segment.clone(),
                scope: InvalidationScope::Own,
                sensitivity: Sensitivity::AnyColumn,
                triggers: BTreeSet::from([LifecycleEvent::Destroy]),
                identity: Identity::Column(pk.clone()),
            },
        );

        let forward = |lookup: OwnerLookup, triggers: BTreeSet<LifecycleEvent>| Dependent {
            owner: entity.name.clone(),
            segment: segment.clone(),
            scope: InvalidationScope::Forward,
            sensitivity: Sensitivity::AnyColumn,
            triggers,
            identity: Identity::Lookup {
                lookup,
                key_column: pk.clone(),
            },
        };

        match &relation.join {
            None => {
                let lookup = OwnerLookup::Referenced {
                    column: relation.remote_key.clone(),
                    owner_column: relation.local_key.clone(),
                };
                self.push(&relation.target, forward(lookup, LifecycleEvent::all()));
            }
            Some(join) => {
                let row = OwnerLookup::Referenced {
                    column: join.owner_key.clone(),
                    owner_column: relation.local_key.clone(),
                };
                self.push(&join.entity, forward(row, LifecycleEvent::all()));

                // A new target row cannot be linked yet.
                let member = OwnerLookup::Joined {
                    column: relation.remote_key.clone(),
                    join_entity: join.entity.clone(),
                    join_target_key: join.target_key.clone(),
                    join_owner_key: join.owner_key.clone(),
                    owner_column: relation.local_key.clone(),
                };
                self.push(
                    &relation.target,
                    forward(
                        member,
                        BTreeSet::from([LifecycleEvent::Update, LifecycleEvent::Destroy]),
                    ),
                );
            }
        }
    }

    /// Computed attribute expiring by rows reachable through `relation`.
    fn add_relation_dependency(
        &mut self,
        target: &EntityDescriptor,
        relation: &RelationDescriptor,
        key_column: Option<&str>,
        base: Dependent,
    ) {
        let Some(key_column) = key_column else {
            let global = Dependent {
                scope: InvalidationScope::Global,
                ..base
            };
            if let Some(join) = &relation.join {
                self.push(
                    &join.entity,
                    Dependent {
                        sensitivity: Sensitivity::AnyColumn,
                        ..global.clone()
                    },
                );
            }
            self.push(&target.name, global);
            return;
        };

        let lookup_dependent = |lookup: OwnerLookup, base: Dependent| Dependent {
            scope: InvalidationScope::Forward,
            identity: Identity::Lookup {
                lookup,
                key_column: key_column.to_string(),
            },
            ..base
        };

        match (&relation.join, relation.is_owning()) {
            (None, true) => {
                let lookup = OwnerLookup::Referencing {
                    column: relation.remote_key.clone(),
                    owner_fk: relation.local_key.clone(),
                };
                self.push(&target.name, lookup_dependent(lookup, base));
            }
            (None, false) => {
                let lookup = OwnerLookup::Referenced {
                    column: relation.remote_key.clone(),
                    owner_column: relation.local_key.clone(),
                };
                self.push(&target.name, lookup_dependent(lookup, base));
            }
            (Some(join), _) => {
                let row = OwnerLookup::Referenced {
                    column: join.owner_key.clone(),
                    owner_column: relation.local_key.clone(),
                };
                self.push(
                    &join.entity,
                    lookup_dependent(
                        row,
                        Dependent {
                            sensitivity: Sensitivity::AnyColumn,
                            ..base.clone()
                        },
                    ),
                );
                let member = OwnerLookup::Joined {
                    column: relation.remote_key.clone(),
                    join_entity: join.entity.clone(),
                    join_target_key: join.target_key.clone(),
                    join_owner_key: join.owner_key.clone(),
                    owner_column: relation.local_key.clone(),
                };
                let triggers = base
                    .triggers
                    .iter()
                    .copied()
                    .filter(|e| *e != LifecycleEvent::Create)
                    .collect();
                self.push(
                    &target.name,
                    lookup_dependent(member, Dependent { triggers, ..base }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitivity_any_column_needs_a_change() {
        assert!(!Sensitivity::AnyColumn.is_stale(&BTreeSet::new()));
        assert!(Sensitivity::AnyColumn.is_stale(&BTreeSet::from(["name".to_string()])));
    }

    #[test]
    fn test_sensitivity_columns_intersect() {
        let s = Sensitivity::Columns(BTreeSet::from(["last_login_at".to_string()]));
        assert!(!s.is_stale(&BTreeSet::from(["name".to_string()])));
        assert!(s.is_stale(&BTreeSet::from([
            "name".to_string(),
            "last_login_at".to_string()
        ])));
    }

    #[test]
    fn test_owner_lookup_column() {
        let lookup = OwnerLookup::Joined {
            column: "id".into(),
            join_entity: "Membership".into(),
            join_target_key: "member_id".into(),
            join_owner_key: "group_id".into(),
            owner_column: "id".into(),
        };
        assert_eq!(lookup.column(), "id");
    }
}
