//! Entity and attribute descriptors.
//!
//! Descriptors are produced once by [`crate::RegistryBuilder::build`] and are
//! read-only afterwards. Attribute names resolve by map lookup into a tagged
//! [`AttributeKind`]; nothing is discovered at call time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::identity::Identifier;
use crate::key::{CacheKey, KeySegment};
use crate::persistence::AttributeComputer;

/// Mutation lifecycle events a computed attribute can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Create,
    Update,
    Destroy,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 3] = [Self::Create, Self::Update, Self::Destroy];

    pub fn all() -> BTreeSet<LifecycleEvent> {
        Self::ALL.into_iter().collect()
    }
}

/// Association cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

/// Which side of a relation stores the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForeignKeySide {
    /// The declaring record stores the key (belongs-to).
    Owning,
    /// The target stores the key (has-one / has-many), or a join table does.
    Owned,
}

/// Intermediate entity of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinDescriptor {
    /// Join entity name. Must itself be registered.
    pub entity: String,
    /// Join column referencing the declaring entity.
    pub owner_key: String,
    /// Join column referencing the target entity.
    pub target_key: String,
}

/// Resolved relation metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub target: String,
    pub cardinality: Cardinality,
    pub side: ForeignKeySide,
    /// Column read off the declaring record to look the target up: the
    /// foreign key when owning, the owner key (usually the primary key)
    /// otherwise.
    pub local_key: String,
    /// Column on the target matched against the local value: the target's
    /// primary key when owning or joined, the foreign key when owned.
    pub remote_key: String,
    pub join: Option<JoinDescriptor>,
}

impl RelationDescriptor {
    /// Forward (`reverse = false`) or reverse lookup key.
    ///
    /// Owning side: forward is the foreign-key column, reverse the target's
    /// primary key. Owned side: forward is the declaring entity's owner key,
    /// reverse the foreign-key column on the target. Joined: reverse is the
    /// join table's column pointing back at the declaring entity.
    pub fn foreign_key(&self, reverse: bool) -> &str {
        match (reverse, &self.join) {
            (false, _) => &self.local_key,
            (true, Some(join)) => &join.owner_key,
            (true, None) => &self.remote_key,
        }
    }

    pub fn is_owning(&self) -> bool {
        self.side == ForeignKeySide::Owning
    }
}

/// Where a computed attribute's dependency lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySource {
    /// Rows of a registered entity.
    Entity(String),
    /// Rows reachable through a relation declared on the same entity.
    Relation(String),
}

/// One resolved `expire_by` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub source: DependencySource,
    /// Columns whose change expires the attribute; `None` means any column.
    pub columns: Option<BTreeSet<String>>,
}

/// Metadata of a declared computed attribute.
#[derive(Debug, Clone)]
pub struct ComputedDescriptor {
    pub computer: Arc<dyn AttributeComputer>,
    pub expire_by: Vec<Dependency>,
    pub triggers: BTreeSet<LifecycleEvent>,
    /// Column of the declaring entity that addresses the value; `None` for
    /// identifier-independent aggregates.
    pub identifier_column: Option<String>,
}

impl ComputedDescriptor {
    pub fn is_global(&self) -> bool {
        self.identifier_column.is_none()
    }
}

/// Attribute kind, resolved once at registration.
#[derive(Debug, Clone)]
pub enum AttributeKind {
    Column { column: String },
    ToOne(RelationDescriptor),
    ToMany(RelationDescriptor),
    Computed(ComputedDescriptor),
}

/// A logical cacheable fact about an entity.
#[derive(Debug, Clone)]
pub struct AttributeDescriptor {
    pub name: String,
    pub kind: AttributeKind,
}

impl AttributeDescriptor {
    pub fn relation(&self) -> Option<&RelationDescriptor> {
        match &self.kind {
            AttributeKind::ToOne(r) | AttributeKind::ToMany(r) => Some(r),
            _ => None,
        }
    }

    pub fn computed(&self) -> Option<&ComputedDescriptor> {
        match &self.kind {
            AttributeKind::Computed(c) => Some(c),
            _ => None,
        }
    }

    pub fn cardinality(&self) -> Option<Cardinality> {
        self.relation().map(|r| r.cardinality)
    }

    /// Identifier-independent aggregate.
    pub fn is_global(&self) -> bool {
        self.computed().is_some_and(ComputedDescriptor::is_global)
    }

    /// Key segment this attribute caches under.
    ///
    /// An owning to-one relation caches the foreign-key value, so it shares
    /// its segment with the foreign-key column.
    pub fn key_segment(&self) -> KeySegment {
        match &self.kind {
            AttributeKind::ToOne(r) if r.is_owning() => {
                KeySegment::Attribute(r.local_key.clone())
            }
            _ => KeySegment::Attribute(self.name.clone()),
        }
    }
}

/// The two implicit methods every attribute gains.
#[derive(Debug, Clone, Copy)]
pub enum AttributeMethod<'a> {
    Fetch(&'a AttributeDescriptor),
    Clean(&'a AttributeDescriptor),
}

/// Prefix of the implicit clean method.
pub const CLEAN_PREFIX: &str = "clean_";

/// Per-entity metadata.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub(crate) name: String,
    pub(crate) primary_key: String,
    pub(crate) columns: BTreeSet<String>,
    pub(crate) attributes: BTreeMap<String, AttributeDescriptor>,
    pub(crate) lookup_columns: BTreeSet<String>,
}

impl EntityDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// Columns declared as record-cache lookup keys via `cache_by`.
    pub fn lookup_columns(&self) -> impl Iterator<Item = &str> {
        self.lookup_columns.iter().map(String::as_str)
    }

    pub fn is_lookup_column(&self, column: &str) -> bool {
        column == self.primary_key || self.lookup_columns.contains(column)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes.values()
    }

    /// Resolve a column, relation or computed attribute by name.
    pub fn resolve(&self, name: &str) -> Result<&AttributeDescriptor, ConfigError> {
        self.attributes
            .get(name)
            .ok_or_else(|| ConfigError::UnknownAttribute {
                entity: self.name.clone(),
                attribute: name.to_string(),
            })
    }

    /// Resolve `name` or `clean_<name>` to the implicit fetch/clean method.
    pub fn resolve_method(&self, method: &str) -> Result<AttributeMethod<'_>, ConfigError> {
        if let Some(attribute) = self.attributes.get(method) {
            return Ok(AttributeMethod::Fetch(attribute));
        }
        match method.strip_prefix(CLEAN_PREFIX) {
            Some(name) => self.resolve(name).map(AttributeMethod::Clean),
            None => Err(ConfigError::UnknownAttribute {
                entity: self.name.clone(),
                attribute: method.to_string(),
            }),
        }
    }

    pub fn relation(&self, name: &str) -> Result<&RelationDescriptor, ConfigError> {
        self.resolve(name)?
            .relation()
            .ok_or_else(|| ConfigError::UnknownAttribute {
                entity: self.name.clone(),
                attribute: name.to_string(),
            })
    }

    pub fn cardinality(&self, relation: &str) -> Result<Cardinality, ConfigError> {
        Ok(self.relation(relation)?.cardinality)
    }

    pub fn foreign_key(&self, relation: &str, reverse: bool) -> Result<&str, ConfigError> {
        Ok(self.relation(relation)?.foreign_key(reverse))
    }

    pub fn join_table_of(&self, relation: &str) -> Result<Option<&JoinDescriptor>, ConfigError> {
        Ok(self.relation(relation)?.join.as_ref())
    }

    /// Record cache key by primary key.
    pub fn record_key(&self, id: Identifier) -> CacheKey {
        CacheKey::record(self.name.clone(), id)
    }

    /// Record cache key by `column`; falls back to the primary-key form.
    pub fn record_key_by(&self, column: &str, value: Identifier) -> CacheKey {
        if column == self.primary_key {
            self.record_key(value)
        } else {
            CacheKey::record_by(self.name.clone(), column, value)
        }
    }

    /// Cache key of `attribute` at `identifier`.
    ///
    /// Global attributes ignore the identifier; every other attribute
    /// requires one.
    pub fn attribute_key(
        &self,
        attribute: &AttributeDescriptor,
        identifier: Option<&Identifier>,
    ) -> Result<CacheKey, ConfigError> {
        if attribute.is_global() {
            return Ok(CacheKey::new(self.name.clone(), attribute.key_segment(), None));
        }
        let id = identifier.ok_or_else(|| ConfigError::MissingIdentifier {
            entity: self.name.clone(),
            attribute: attribute.name.clone(),
        })?;
        Ok(CacheKey::new(
            self.name.clone(),
            attribute.key_segment(),
            Some(id.clone()),
        ))
    }
}
