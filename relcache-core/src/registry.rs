//! RegistryBuilder for constructing an immutable Registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::dependency::{Dependent, DependencyIndex};
use crate::entity::{
    AttributeDescriptor, AttributeKind, Cardinality, ComputedDescriptor, Dependency,
    DependencySource, EntityDescriptor, ForeignKeySide, JoinDescriptor, LifecycleEvent,
    RelationDescriptor,
};
use crate::error::ConfigError;
use crate::persistence::AttributeComputer;

/// Default primary-key column.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// `UserAchievement` -> `user_achievement`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Conventional foreign-key column pointing at `entity`.
fn conventional_fk(entity: &str) -> String {
    format!("{}_id", snake_case(entity))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelationShape {
    BelongsTo,
    HasOne,
    HasMany,
    HasManyThrough,
}

/// Declaration of a relation, before resolution.
///
/// The shorthand builder methods cover the conventional key names; use this
/// directly to override them.
#[derive(Debug, Clone)]
pub struct RelationSpec {
    name: String,
    target: String,
    shape: RelationShape,
    foreign_key: Option<String>,
    owner_key: Option<String>,
    through: Option<String>,
    join_owner_key: Option<String>,
    join_target_key: Option<String>,
}

impl RelationSpec {
    fn new(name: impl Into<String>, target: impl Into<String>, shape: RelationShape) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            shape,
            foreign_key: None,
            owner_key: None,
            through: None,
            join_owner_key: None,
            join_target_key: None,
        }
    }

    /// The declaring record stores `<name>_id`.
    pub fn belongs_to(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationShape::BelongsTo)
    }

    /// The target stores `<snake(owner)>_id`; at most one row.
    pub fn has_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationShape::HasOne)
    }

    /// The target stores `<snake(owner)>_id`.
    pub fn has_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationShape::HasMany)
    }

    /// Many-to-many through rows of `join`.
    pub fn has_many_through(
        name: impl Into<String>,
        target: impl Into<String>,
        join: impl Into<String>,
    ) -> Self {
        let mut spec = Self::new(name, target, RelationShape::HasManyThrough);
        spec.through = Some(join.into());
        spec
    }

    /// Override the foreign-key column.
    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    /// Override the declaring entity's column the foreign key refers to.
    pub fn owner_key(mut self, column: impl Into<String>) -> Self {
        self.owner_key = Some(column.into());
        self
    }

    /// Override the join entity's owner-side and target-side columns.
    pub fn join_keys(mut self, owner: impl Into<String>, target: impl Into<String>) -> Self {
        self.join_owner_key = Some(owner.into());
        self.join_target_key = Some(target.into());
        self
    }
}

/// Declaration of a computed attribute.
#[derive(Debug, Clone)]
pub struct ComputedSpec {
    name: String,
    computer: Arc<dyn AttributeComputer>,
    global: bool,
    keyed_by: Option<String>,
    expire_by: Vec<(String, Option<BTreeSet<String>>)>,
    triggers: Option<BTreeSet<LifecycleEvent>>,
}

impl ComputedSpec {
    pub fn new(name: impl Into<String>, computer: impl AttributeComputer + 'static) -> Self {
        Self {
            name: name.into(),
            computer: Arc::new(computer),
            global: false,
            keyed_by: None,
            expire_by: Vec::new(),
            triggers: None,
        }
    }

    /// Identifier-independent aggregate.
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// Address the value by `column` instead of the primary key.
    pub fn keyed_by(mut self, column: impl Into<String>) -> Self {
        self.keyed_by = Some(column.into());
        self
    }

    /// Expire on any column change of `source` (an entity or a relation of
    /// the declaring entity).
    pub fn expire_by(mut self, source: impl Into<String>) -> Self {
        self.expire_by.push((source.into(), None));
        self
    }

    /// Expire only when one of `columns` of `source` changes.
    pub fn expire_by_columns<I, S>(mut self, source: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = columns.into_iter().map(Into::into).collect();
        self.expire_by.push((source.into(), Some(columns)));
        self
    }

    /// Restrict the lifecycle events that expire the value.
    pub fn on(mut self, events: impl IntoIterator<Item = LifecycleEvent>) -> Self {
        self.triggers = Some(events.into_iter().collect());
        self
    }
}

#[derive(Debug, Clone)]
struct EntityDraft {
    name: String,
    primary_key: String,
    columns: BTreeSet<String>,
    relations: Vec<RelationSpec>,
    lookup_columns: BTreeSet<String>,
    computed: Vec<ComputedSpec>,
}

/// Builder for constructing an immutable Registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entities: BTreeMap<String, EntityDraft>,
}

impl RegistryBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity definition.
    pub fn add_entity(&mut self, name: impl Into<String>) -> EntityBuilder<'_> {
        EntityBuilder {
            builder: self,
            draft: EntityDraft {
                name: name.into(),
                primary_key: DEFAULT_PRIMARY_KEY.to_string(),
                columns: BTreeSet::new(),
                relations: Vec::new(),
                lookup_columns: BTreeSet::new(),
                computed: Vec::new(),
            },
        }
    }

    /// Resolve every relation, join and dependency, then index dependents.
    pub fn build(self) -> Result<Registry, ConfigError> {
        let mut entities = BTreeMap::new();
        for draft in self.entities.values() {
            let descriptor = self.resolve_entity(draft)?;
            entities.insert(descriptor.name.clone(), descriptor);
        }
        for draft in self.entities.values() {
            self.resolve_computed(draft, &mut entities)?;
        }

        let index = DependencyIndex::build(&entities)?;
        Ok(Registry { entities, index })
    }

    fn draft(&self, name: &str) -> Option<&EntityDraft> {
        self.entities.get(name)
    }

    fn resolve_entity(&self, draft: &EntityDraft) -> Result<EntityDescriptor, ConfigError> {
        let undeclared = |column: &str| ConfigError::UndeclaredColumn {
            entity: draft.name.clone(),
            column: column.to_string(),
        };
        if !draft.columns.contains(&draft.primary_key) {
            return Err(undeclared(&draft.primary_key));
        }
        if let Some(column) = draft
            .lookup_columns
            .iter()
            .find(|c| !draft.columns.contains(*c))
        {
            return Err(undeclared(column));
        }

        let mut attributes = BTreeMap::new();
        for column in &draft.columns {
            attributes.insert(
                column.clone(),
                AttributeDescriptor {
                    name: column.clone(),
                    kind: AttributeKind::Column {
                        column: column.clone(),
                    },
                },
            );
        }

        for spec in &draft.relations {
            let relation = self.resolve_relation(draft, spec)?;
            let kind = match relation.cardinality {
                Cardinality::One => AttributeKind::ToOne(relation),
                Cardinality::Many => AttributeKind::ToMany(relation),
            };
            insert_attribute(&mut attributes, &draft.name, &spec.name, kind)?;
        }

        Ok(EntityDescriptor {
            name: draft.name.clone(),
            primary_key: draft.primary_key.clone(),
            columns: draft.columns.clone(),
            attributes,
            lookup_columns: draft.lookup_columns.clone(),
        })
    }

    fn resolve_relation(
        &self,
        draft: &EntityDraft,
        spec: &RelationSpec,
    ) -> Result<RelationDescriptor, ConfigError> {
        let target = self
            .draft(&spec.target)
            .ok_or_else(|| ConfigError::UndeclaredTarget {
                entity: draft.name.clone(),
                relation: spec.name.clone(),
                target: spec.target.clone(),
            })?;
        let require = |entity: &EntityDraft, column: &str| {
            if entity.columns.contains(column) {
                Ok(column.to_string())
            } else {
                Err(ConfigError::UndeclaredColumn {
                    entity: entity.name.clone(),
                    column: column.to_string(),
                })
            }
        };
        let owner_key = require(
            draft,
            spec.owner_key.as_deref().unwrap_or(&draft.primary_key),
        )?;

        let relation = match spec.shape {
            RelationShape::BelongsTo => {
                let fk = spec
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| format!("{}_id", spec.name));
                RelationDescriptor {
                    target: target.name.clone(),
                    cardinality: Cardinality::One,
                    side: ForeignKeySide::Owning,
                    local_key: require(draft, &fk)?,
                    remote_key: target.primary_key.clone(),
                    join: None,
                }
            }
            RelationShape::HasOne | RelationShape::HasMany => {
                let fk = spec
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| conventional_fk(&draft.name));
                RelationDescriptor {
                    target: target.name.clone(),
                    cardinality: if spec.shape == RelationShape::HasOne {
                        Cardinality::One
                    } else {
                        Cardinality::Many
                    },
                    side: ForeignKeySide::Owned,
                    local_key: owner_key,
                    remote_key: require(target, &fk)?,
                    join: None,
                }
            }
            RelationShape::HasManyThrough => {
                let unsupported = |reason: String| ConfigError::UnsupportedJoin {
                    entity: draft.name.clone(),
                    relation: spec.name.clone(),
                    reason,
                };
                let join_name = spec.through.clone().unwrap_or_default();
                let join = self
                    .draft(&join_name)
                    .ok_or_else(|| unsupported(format!("join entity {join_name} is not declared")))?;
                let join_owner_key = spec
                    .join_owner_key
                    .clone()
                    .unwrap_or_else(|| conventional_fk(&draft.name));
                let join_target_key = spec
                    .join_target_key
                    .clone()
                    .unwrap_or_else(|| conventional_fk(&target.name));
                for key in [&join_owner_key, &join_target_key] {
                    if !join.columns.contains(key) {
                        return Err(unsupported(format!("{join_name} has no column {key}")));
                    }
                }
                RelationDescriptor {
                    target: target.name.clone(),
                    cardinality: Cardinality::Many,
                    side: ForeignKeySide::Owned,
                    local_key: owner_key,
                    remote_key: target.primary_key.clone(),
                    join: Some(JoinDescriptor {
                        entity: join.name.clone(),
                        owner_key: join_owner_key,
                        target_key: join_target_key,
                    }),
                }
            }
        };
        Ok(relation)
    }

    fn resolve_computed(
        &self,
        draft: &EntityDraft,
        entities: &mut BTreeMap<String, EntityDescriptor>,
    ) -> Result<(), ConfigError> {
        for spec in &draft.computed {
            let mut expire_by = Vec::with_capacity(spec.expire_by.len().max(1));
            let declared: Vec<(String, Option<BTreeSet<String>>)> = if spec.expire_by.is_empty() {
                vec![(draft.name.clone(), None)]
            } else {
                spec.expire_by.clone()
            };

            for (source_name, columns) in declared {
                let owner = entities
                    .get(&draft.name)
                    .ok_or_else(|| ConfigError::UnknownEntity {
                        entity: draft.name.clone(),
                    })?;
                let (source, source_entity) = match owner.relation(&source_name) {
                    Ok(relation) => (
                        DependencySource::Relation(source_name.clone()),
                        relation.target.clone(),
                    ),
                    Err(_) if self.entities.contains_key(&source_name) => (
                        DependencySource::Entity(source_name.clone()),
                        source_name.clone(),
                    ),
                    Err(_) => {
                        return Err(ConfigError::UndeclaredDependency {
                            entity: draft.name.clone(),
                            attribute: spec.name.clone(),
                            dependency: source_name,
                        })
                    }
                };
                if let (Some(columns), Some(target)) = (&columns, self.draft(&source_entity)) {
                    if let Some(column) = columns.iter().find(|c| !target.columns.contains(*c)) {
                        return Err(ConfigError::UndeclaredColumn {
                            entity: source_entity,
                            column: column.clone(),
                        });
                    }
                }
                expire_by.push(Dependency { source, columns });
            }

            let identifier_column = if spec.global {
                None
            } else {
                let column = spec.keyed_by.as_deref().unwrap_or(&draft.primary_key);
                if !draft.columns.contains(column) {
                    return Err(ConfigError::UndeclaredColumn {
                        entity: draft.name.clone(),
                        column: column.to_string(),
                    });
                }
                Some(column.to_string())
            };

            let descriptor = ComputedDescriptor {
                computer: Arc::clone(&spec.computer),
                expire_by,
                triggers: spec.triggers.clone().unwrap_or_else(LifecycleEvent::all),
                identifier_column,
            };
            let entity = entities
                .get_mut(&draft.name)
                .ok_or_else(|| ConfigError::UnknownEntity {
                    entity: draft.name.clone(),
                })?;
            insert_attribute(
                &mut entity.attributes,
                &draft.name,
                &spec.name,
                AttributeKind::Computed(descriptor),
            )?;
        }
        Ok(())
    }
}

fn kind_label(kind: &AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Column { .. } => "column",
        AttributeKind::ToOne(_) | AttributeKind::ToMany(_) => "relation",
        AttributeKind::Computed(_) => "computed attribute",
    }
}

fn insert_attribute(
    attributes: &mut BTreeMap<String, AttributeDescriptor>,
    entity: &str,
    name: &str,
    kind: AttributeKind,
) -> Result<(), ConfigError> {
    if let Some(existing) = attributes.get(name) {
        return Err(ConfigError::AttributeCollision {
            entity: entity.to_string(),
            attribute: name.to_string(),
            existing: kind_label(&existing.kind).to_string(),
        });
    }
    attributes.insert(
        name.to_string(),
        AttributeDescriptor {
            name: name.to_string(),
            kind,
        },
    );
    Ok(())
}

/// Builder for an entity definition.
pub struct EntityBuilder<'a> {
    builder: &'a mut RegistryBuilder,
    draft: EntityDraft,
}

impl<'a> EntityBuilder<'a> {
    /// Set the primary-key column (default `id`).
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.draft.primary_key = column.into();
        self
    }

    /// Declare columns.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.draft.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn belongs_to(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relation(RelationSpec::belongs_to(name, target))
    }

    pub fn has_one(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relation(RelationSpec::has_one(name, target))
    }

    pub fn has_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relation(RelationSpec::has_many(name, target))
    }

    pub fn has_many_through(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        join: impl Into<String>,
    ) -> Self {
        self.relation(RelationSpec::has_many_through(name, target, join))
    }

    /// Declare a relation with explicit keys.
    pub fn relation(mut self, spec: RelationSpec) -> Self {
        self.draft.relations.push(spec);
        self
    }

    /// Declare a record cache addressed by a unique non-primary column.
    pub fn cache_by(mut self, column: impl Into<String>) -> Self {
        self.draft.lookup_columns.insert(column.into());
        self
    }

    /// Declare a computed attribute.
    pub fn cached_attribute(mut self, spec: ComputedSpec) -> Self {
        self.draft.computed.push(spec);
        self
    }

    /// Finish building this entity.
    pub fn done(self) -> Result<(), ConfigError> {
        if self.builder.entities.contains_key(&self.draft.name) {
            return Err(ConfigError::DuplicateEntity {
                entity: self.draft.name,
            });
        }
        self.builder
            .entities
            .insert(self.draft.name.clone(), self.draft);
        Ok(())
    }
}

/// Immutable, resolved entity metadata plus the dependency index.
#[derive(Debug)]
pub struct Registry {
    entities: BTreeMap<String, EntityDescriptor>,
    index: DependencyIndex,
}

impl Registry {
    /// Create a new registry builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(name)
    }

    /// Like [`Registry::entity`], as a [`ConfigError`].
    pub fn require(&self, name: &str) -> Result<&EntityDescriptor, ConfigError> {
        self.entity(name).ok_or_else(|| ConfigError::UnknownEntity {
            entity: name.to_string(),
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    /// Rules for keys a mutation of `entity` may stale.
    pub fn dependents_of(&self, entity: &str) -> &[Dependent] {
        self.index
            .dependents
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Columns of `entity` the mutation hooks need before a row changes.
    pub fn tracked_columns(&self, entity: &str) -> impl Iterator<Item = &str> {
        self.index
            .tracked
            .get(entity)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{Identity, InvalidationScope, OwnerLookup, Sensitivity};
    use crate::entity::AttributeMethod;
    use crate::identity::Identifier;
    use crate::key::KeySegment;
    use crate::persistence::{CountWhere, Predicate};

    fn blog() -> RegistryBuilder {
        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("User")
            .columns(["id", "name", "email", "language_id", "last_login_at"])
            .belongs_to("language", "Language")
            .has_many("posts", "Post")
            .has_one("profile", "Profile")
            .done()
            .unwrap();
        builder
            .add_entity("Post")
            .columns(["id", "user_id", "title"])
            .belongs_to("user", "User")
            .done()
            .unwrap();
        builder
            .add_entity("Language")
            .columns(["id", "name"])
            .done()
            .unwrap();
        builder
            .add_entity("Profile")
            .columns(["id", "user_id", "point", "token"])
            .cache_by("token")
            .done()
            .unwrap();
        builder
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("User"), "user");
        assert_eq!(snake_case("UserAchievement"), "user_achievement");
    }

    #[test]
    fn test_relation_conventions() {
        let registry = blog().build().unwrap();
        let user = registry.require("User").unwrap();

        assert_eq!(user.foreign_key("language", false).unwrap(), "language_id");
        assert_eq!(user.foreign_key("language", true).unwrap(), "id");
        assert_eq!(user.foreign_key("posts", false).unwrap(), "id");
        assert_eq!(user.foreign_key("posts", true).unwrap(), "user_id");
        assert_eq!(user.cardinality("posts").unwrap(), Cardinality::Many);
        assert_eq!(user.cardinality("profile").unwrap(), Cardinality::One);
        assert!(user.join_table_of("posts").unwrap().is_none());
    }

    #[test]
    fn test_has_many_through_keys() {
        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("Group")
            .columns(["id"])
            .has_many_through("members", "Member", "Membership")
            .done()
            .unwrap();
        builder
            .add_entity("Membership")
            .columns(["id", "group_id", "member_id"])
            .done()
            .unwrap();
        builder.add_entity("Member").columns(["id"]).done().unwrap();
        let registry = builder.build().unwrap();
        let group = registry.require("Group").unwrap();

        assert_eq!(group.foreign_key("members", true).unwrap(), "group_id");
        let join = group.join_table_of("members").unwrap().unwrap();
        assert_eq!(join.entity, "Membership");
        assert_eq!(join.target_key, "member_id");
    }

    #[test]
    fn test_join_without_key_column_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("Group")
            .columns(["id"])
            .has_many_through("members", "Member", "Membership")
            .done()
            .unwrap();
        builder
            .add_entity("Membership")
            .columns(["id", "group_id"])
            .done()
            .unwrap();
        builder.add_entity("Member").columns(["id"]).done().unwrap();

        assert!(matches!(
            builder.build(),
            Err(ConfigError::UnsupportedJoin { .. })
        ));
    }

    #[test]
    fn test_duplicate_entity() {
        let mut builder = blog();
        let err = builder.add_entity("User").columns(["id"]).done().unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateEntity {
                entity: "User".into()
            }
        );
    }

    #[test]
    fn test_relation_to_undeclared_entity() {
        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("User")
            .columns(["id", "team_id"])
            .belongs_to("team", "Team")
            .done()
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigError::UndeclaredTarget { .. })
        ));
    }

    #[test]
    fn test_attribute_collision() {
        let mut builder = blog();
        builder
            .add_entity("Account")
            .columns(["id", "count"])
            .cached_attribute(ComputedSpec::new("count", CountWhere::new(Predicate::All)).global())
            .done()
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, ConfigError::AttributeCollision { ref existing, .. } if existing == "column"));
    }

    #[test]
    fn test_undeclared_primary_key_and_lookup_column() {
        let mut builder = RegistryBuilder::new();
        builder.add_entity("A").columns(["uuid"]).done().unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigError::UndeclaredColumn { .. })
        ));

        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("A")
            .columns(["id"])
            .cache_by("token")
            .done()
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigError::UndeclaredColumn { .. })
        ));
    }

    #[test]
    fn test_undeclared_dependency() {
        let mut builder = blog();
        builder
            .add_entity("Order")
            .columns(["id"])
            .cached_attribute(
                ComputedSpec::new("total", CountWhere::new(Predicate::All)).expire_by("Invoice"),
            )
            .done()
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigError::UndeclaredDependency { .. })
        ));
    }

    #[test]
    fn test_unmappable_dependency() {
        let mut builder = blog();
        builder
            .add_entity("Order")
            .columns(["id"])
            .cached_attribute(
                ComputedSpec::new("total", CountWhere::new(Predicate::All)).expire_by("Post"),
            )
            .done()
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigError::UnmappableDependency { .. })
        ));
    }

    #[test]
    fn test_resolve_and_methods() {
        let registry = blog().build().unwrap();
        let user = registry.require("User").unwrap();

        assert!(matches!(
            user.resolve("name").unwrap().kind,
            AttributeKind::Column { .. }
        ));
        assert!(matches!(
            user.resolve_method("clean_posts").unwrap(),
            AttributeMethod::Clean(a) if a.name == "posts"
        ));
        assert!(matches!(
            user.resolve_method("posts").unwrap(),
            AttributeMethod::Fetch(_)
        ));
        assert!(matches!(
            user.resolve("nope"),
            Err(ConfigError::UnknownAttribute { .. })
        ));
        assert!(user.resolve_method("clean_nope").is_err());
    }

    #[test]
    fn test_owning_relation_keys_by_foreign_key_column() {
        let registry = blog().build().unwrap();
        let user = registry.require("User").unwrap();
        let language = user.resolve("language").unwrap();
        let key = user
            .attribute_key(language, Some(&Identifier::from(1)))
            .unwrap();
        assert_eq!(key.render("relcache"), "relcache_User_at_language_id_1");
        assert!(user.attribute_key(language, None).is_err());
    }

    #[test]
    fn test_dependents_of_owned_target() {
        let registry = blog().build().unwrap();
        let on_post: Vec<_> = registry
            .dependents_of("Post")
            .iter()
            .filter(|d| d.owner == "User")
            .collect();
        assert_eq!(on_post.len(), 1);
        assert_eq!(on_post[0].segment, KeySegment::Attribute("posts".into()));
        assert_eq!(on_post[0].scope, InvalidationScope::Forward);
        assert_eq!(
            on_post[0].identity,
            Identity::Lookup {
                lookup: OwnerLookup::Referenced {
                    column: "user_id".into(),
                    owner_column: "id".into(),
                },
                key_column: "id".into(),
            }
        );
    }

    #[test]
    fn test_global_dependency_and_tracked_columns() {
        let mut builder = blog();
        builder
            .add_entity("Account")
            .columns(["id", "active"])
            .cached_attribute(
                ComputedSpec::new("count", CountWhere::new(Predicate::All)).global(),
            )
            .done()
            .unwrap();
        builder
            .add_entity("Customer")
            .columns(["id", "last_login_at"])
            .cached_attribute(
                ComputedSpec::new("active_count", CountWhere::new(Predicate::All))
                    .global()
                    .expire_by_columns("Customer", ["last_login_at"]),
            )
            .done()
            .unwrap();
        let registry = builder.build().unwrap();

        let global = registry
            .dependents_of("Customer")
            .iter()
            .find(|d| d.scope == InvalidationScope::Global)
            .unwrap();
        assert_eq!(global.identity, Identity::Global);
        assert_eq!(
            global.sensitivity,
            Sensitivity::Columns(BTreeSet::from(["last_login_at".to_string()]))
        );

        let tracked: Vec<_> = registry.tracked_columns("User").collect();
        assert!(tracked.contains(&"id"));
        assert!(tracked.contains(&"language_id"));
        let tracked: Vec<_> = registry.tracked_columns("Post").collect();
        assert!(tracked.contains(&"user_id"));
    }

    #[test]
    fn test_custom_keyed_computed_attribute() {
        let mut builder = blog();
        builder
            .add_entity("Mailbox")
            .columns(["id", "email"])
            .cached_attribute(
                ComputedSpec::new("email_valid", CountWhere::new(Predicate::All))
                    .keyed_by("email"),
            )
            .done()
            .unwrap();
        let registry = builder.build().unwrap();
        let rule = registry
            .dependents_of("Mailbox")
            .iter()
            .find(|d| d.segment == KeySegment::Attribute("email_valid".into()))
            .unwrap();
        assert_eq!(rule.identity, Identity::Column("email".into()));
    }
}
