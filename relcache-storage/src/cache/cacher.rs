//! Read-through cacher.
//!
//! Every read follows the same route: one store read; on a live entry,
//! unwrap the sentinel and return; otherwise fetch through the attribute's
//! descriptor, wrap, write through and return the real value. Store trouble
//! degrades to a direct fetch, never to an error. Cleaning goes the other
//! way: a store failure there is the caller's problem and propagates.

use std::collections::BTreeSet;
use std::sync::Arc;

use relcache_core::{
    filter, AttributeDescriptor, AttributeKind, AttributeMethod, CacheKey, CachedValue,
    CacherConfig, Cardinality, ComputeContext, ConfigError, EntityDescriptor, FetchError,
    Identifier, Instance, Persistence, Record, Registry, RelationDescriptor, RelcacheResult,
    StoreError,
};
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::CacheStore;

/// What an implicit method produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// `name`: the attribute's value.
    Fetched(Value),
    /// `clean_<name>`: whether a live entry was removed.
    Cleaned(bool),
}

/// Read-through cache over entity attributes.
///
/// # Type Parameters
///
/// - `S`: The cache store holding encoded entries
/// - `P`: The persistence adapter queried on a miss
///
/// # Example
///
/// ```ignore
/// let cacher = Cacher::new(registry, store, persistence, CacherConfig::default());
///
/// let posts = cacher.get("User", Some(&Identifier::from(1)), "posts").await?;
/// let count = cacher.get("Account", None, "count").await?;
/// cacher.clean("User", Some(&Identifier::from(1)), "posts").await?;
/// ```
pub struct Cacher<S, P>
where
    S: CacheStore,
    P: Persistence,
{
    registry: Arc<Registry>,
    store: Arc<S>,
    persistence: Arc<P>,
    config: CacherConfig,
}

impl<S, P> Cacher<S, P>
where
    S: CacheStore,
    P: Persistence,
{
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<S>,
        persistence: Arc<P>,
        config: CacherConfig,
    ) -> Self {
        Self {
            registry,
            store,
            persistence,
            config,
        }
    }

    /// Create a cacher with default configuration.
    pub fn with_defaults(registry: Arc<Registry>, store: Arc<S>, persistence: Arc<P>) -> Self {
        Self::new(registry, store, persistence, CacherConfig::default())
    }

    pub fn config(&self) -> &CacherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Store key of `key` under the configured namespace.
    pub fn render(&self, key: &CacheKey) -> String {
        key.render(&self.config.namespace)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Value of `attribute` at `id`. Global attributes take `None`.
    pub async fn get(
        &self,
        entity: &str,
        id: Option<&Identifier>,
        attribute: &str,
    ) -> RelcacheResult<Value> {
        let descriptor = self.registry.require(entity)?;
        let attribute = descriptor.resolve(attribute)?;
        self.read_attribute(descriptor, attribute, id, None).await
    }

    /// Record cache by primary key.
    pub async fn find(&self, entity: &str, id: &Identifier) -> RelcacheResult<Option<Record>> {
        let descriptor = self.registry.require(entity)?;
        let key = descriptor.record_key(id.clone());
        if let Some(value) = self.lookup(&key).await {
            return Ok(Record::from_value(value));
        }

        let record = self.persistence.find_by_primary_key(descriptor, id).await?;
        self.write_record(&key, record.as_ref()).await;
        Ok(record)
    }

    /// Record cache by a `cache_by` column.
    pub async fn find_by(
        &self,
        entity: &str,
        column: &str,
        value: &Identifier,
    ) -> RelcacheResult<Option<Record>> {
        let descriptor = self.registry.require(entity)?;
        if column == descriptor.primary_key() {
            return self.find(entity, value).await;
        }
        if !descriptor.is_lookup_column(column) {
            return Err(ConfigError::UnknownAttribute {
                entity: entity.to_string(),
                attribute: format!("by_{column}"),
            }
            .into());
        }

        let key = descriptor.record_key_by(column, value.clone());
        if let Some(cached) = self.lookup(&key).await {
            return Ok(Record::from_value(cached));
        }

        let record = self
            .persistence
            .find_by_columns(descriptor, &filter(column, value.value().clone()), None)
            .await?
            .into_iter()
            .next();
        self.write_record(&key, record.as_ref()).await;
        Ok(record)
    }

    /// Value of `attribute` for a record the caller already holds.
    ///
    /// Associations the caller already loaded are answered without any round
    /// trip and, when `cache_from_loaded_associations` is on, written
    /// through. Columns present on the record are answered from it.
    pub async fn get_for(&self, instance: &Instance, attribute: &str) -> RelcacheResult<Value> {
        let descriptor = self.registry.require(instance.entity())?;
        let attribute = descriptor.resolve(attribute)?;
        let record = instance.record();

        if let Some(loaded) = instance.loaded_value(&attribute.name) {
            if self.config.cache_from_loaded_associations {
                self.cache_loaded(descriptor, attribute, record, loaded)
                    .await;
            }
            return Ok(loaded.clone());
        }
        if let AttributeKind::Column { column } = &attribute.kind {
            if let Some(value) = record.get(column) {
                return Ok(value.clone());
            }
        }

        let id = identifier_for(descriptor, attribute, record);
        self.read_attribute(descriptor, attribute, id.as_ref(), Some(record))
            .await
    }

    /// Dispatch `name` / `clean_<name>`.
    pub async fn call(
        &self,
        entity: &str,
        id: Option<&Identifier>,
        method: &str,
    ) -> RelcacheResult<CallOutcome> {
        let descriptor = self.registry.require(entity)?;
        match descriptor.resolve_method(method)? {
            AttributeMethod::Fetch(attribute) => self
                .read_attribute(descriptor, attribute, id, None)
                .await
                .map(CallOutcome::Fetched),
            AttributeMethod::Clean(attribute) => {
                let key = descriptor.attribute_key(attribute, id)?;
                Ok(CallOutcome::Cleaned(self.clean_key(&key).await?))
            }
        }
    }

    /// Raw view of a key, sentinel included.
    pub async fn peek(&self, key: &CacheKey) -> Result<CachedValue, StoreError> {
        let rendered = self.render(key);
        match self.store.get(&rendered).await? {
            Some(bytes) => CachedValue::decode(&rendered, &bytes),
            None => Ok(CachedValue::Absent),
        }
    }

    // ------------------------------------------------------------------
    // Cleans
    // ------------------------------------------------------------------

    /// Delete exactly the key of `attribute` at `id`.
    pub async fn clean(
        &self,
        entity: &str,
        id: Option<&Identifier>,
        attribute: &str,
    ) -> RelcacheResult<bool> {
        let descriptor = self.registry.require(entity)?;
        let key = descriptor.attribute_key(descriptor.resolve(attribute)?, id)?;
        Ok(self.clean_key(&key).await?)
    }

    pub async fn clean_record(&self, entity: &str, id: &Identifier) -> RelcacheResult<bool> {
        let descriptor = self.registry.require(entity)?;
        Ok(self.clean_key(&descriptor.record_key(id.clone())).await?)
    }

    pub async fn clean_by(
        &self,
        entity: &str,
        column: &str,
        value: &Identifier,
    ) -> RelcacheResult<bool> {
        let descriptor = self.registry.require(entity)?;
        Ok(self
            .clean_key(&descriptor.record_key_by(column, value.clone()))
            .await?)
    }

    /// Delete the record key and every primary-key addressed attribute key
    /// at `id`. Returns how many live entries were removed.
    pub async fn clean_all(&self, entity: &str, id: &Identifier) -> RelcacheResult<usize> {
        let descriptor = self.registry.require(entity)?;
        let mut keys = BTreeSet::new();
        keys.insert(descriptor.record_key(id.clone()));
        for attribute in descriptor.attributes() {
            let keyed_by_pk = attribute.computed().map_or(true, |c| {
                c.identifier_column.as_deref() == Some(descriptor.primary_key())
            });
            if keyed_by_pk {
                keys.insert(descriptor.attribute_key(attribute, Some(id))?);
            }
        }

        let mut removed = 0;
        for key in &keys {
            if self.clean_key(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete one key. Store failures propagate.
    pub async fn clean_key(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let rendered = self.render(key);
        let removed = self.store.delete(&rendered).await?;
        debug!(key = %rendered, removed, "cleaned cache key");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Live value at `key`. Store errors and undecodable entries read as a
    /// miss.
    async fn lookup(&self, key: &CacheKey) -> Option<Value> {
        let rendered = self.render(key);
        match self.store.get(&rendered).await {
            Ok(Some(bytes)) => match CachedValue::decode(&rendered, &bytes) {
                Ok(cached) => {
                    debug!(key = %rendered, "cache hit");
                    cached.into_value()
                }
                Err(e) => {
                    warn!(key = %rendered, error = %e, "Undecodable cache entry, fetching");
                    None
                }
            },
            Ok(None) => {
                debug!(key = %rendered, "cache miss");
                None
            }
            Err(e) => {
                warn!(key = %rendered, error = %e, "Cache store read failed, fetching");
                None
            }
        }
    }

    /// Sentinel-wrap and store `value`. Failures are logged and dropped.
    async fn write_through(&self, key: &CacheKey, value: &Value) {
        let rendered = self.render(key);
        let Some(bytes) = CachedValue::wrap(value.clone()).encode() else {
            return;
        };
        if let Err(e) = self
            .store
            .set(&rendered, bytes, self.config.default_ttl)
            .await
        {
            warn!(key = %rendered, error = %e, "Cache write-through failed");
        }
    }

    async fn write_record(&self, key: &CacheKey, record: Option<&Record>) {
        let value = record.cloned().map(Value::from).unwrap_or(Value::Null);
        self.write_through(key, &value).await;
    }

    async fn read_attribute(
        &self,
        entity: &EntityDescriptor,
        attribute: &AttributeDescriptor,
        id: Option<&Identifier>,
        source: Option<&Record>,
    ) -> RelcacheResult<Value> {
        if let AttributeKind::ToOne(relation) = &attribute.kind {
            if relation.is_owning() {
                return self
                    .read_owning(entity, attribute, relation, id, source)
                    .await;
            }
        }

        let key = entity.attribute_key(attribute, id)?;
        if let Some(value) = self.lookup(&key).await {
            return Ok(value);
        }
        debug!(entity = entity.name(), attribute = %attribute.name, "fetching attribute");
        let value = self.fetch_attribute(entity, attribute, id, source).await?;
        self.write_through(&key, &value).await;
        Ok(value)
    }

    /// Two-level read: the relation key holds the foreign key, the target
    /// comes from its own record cache.
    async fn read_owning(
        &self,
        entity: &EntityDescriptor,
        attribute: &AttributeDescriptor,
        relation: &RelationDescriptor,
        id: Option<&Identifier>,
        source: Option<&Record>,
    ) -> RelcacheResult<Value> {
        let fk = match source.and_then(|r| r.get(&relation.local_key)) {
            Some(fk) => fk.clone(),
            None => {
                let key = entity.attribute_key(attribute, id)?;
                match self.lookup(&key).await {
                    Some(fk) => fk,
                    None => {
                        let id = require_id(entity, attribute, id)?;
                        let fk = self.project_column(entity, id, &relation.local_key).await?;
                        self.write_through(&key, &fk).await;
                        fk
                    }
                }
            }
        };

        let Some(fk) = Identifier::from_value(&fk) else {
            return Ok(Value::Null);
        };
        Ok(self
            .find(&relation.target, &fk)
            .await?
            .map(Value::from)
            .unwrap_or(Value::Null))
    }

    async fn fetch_attribute(
        &self,
        entity: &EntityDescriptor,
        attribute: &AttributeDescriptor,
        id: Option<&Identifier>,
        source: Option<&Record>,
    ) -> RelcacheResult<Value> {
        match &attribute.kind {
            AttributeKind::Column { column } => match source.and_then(|r| r.get(column)) {
                Some(value) => Ok(value.clone()),
                None => {
                    let id = require_id(entity, attribute, id)?;
                    Ok(self.project_column(entity, id, column).await?)
                }
            },
            AttributeKind::ToOne(relation) | AttributeKind::ToMany(relation) => {
                let id = require_id(entity, attribute, id)?;
                self.fetch_related(entity, relation, id, source).await
            }
            AttributeKind::Computed(computed) => {
                let ctx = ComputeContext {
                    persistence: &*self.persistence,
                    registry: &self.registry,
                    entity,
                    identifier: if computed.is_global() { None } else { id },
                };
                Ok(computed.computer.compute(ctx).await?)
            }
        }
    }

    async fn fetch_related(
        &self,
        entity: &EntityDescriptor,
        relation: &RelationDescriptor,
        id: &Identifier,
        source: Option<&Record>,
    ) -> RelcacheResult<Value> {
        let local = match source.and_then(|r| r.get(&relation.local_key)) {
            Some(value) => value.clone(),
            None => self.project_column(entity, id, &relation.local_key).await?,
        };
        if relation.is_owning() {
            return Ok(local);
        }

        let empty = match relation.cardinality {
            Cardinality::One => Value::Null,
            Cardinality::Many => Value::Array(Vec::new()),
        };
        if local.is_null() {
            return Ok(empty);
        }

        let target = self.registry.require(&relation.target)?;
        let rows = match &relation.join {
            None => {
                self.persistence
                    .find_by_columns(target, &filter(relation.remote_key.as_str(), local), None)
                    .await?
            }
            Some(join) => {
                let join_entity = self.registry.require(&join.entity)?;
                let links = self
                    .persistence
                    .find_by_columns(
                        join_entity,
                        &filter(join.owner_key.as_str(), local),
                        Some(std::slice::from_ref(&join.target_key)),
                    )
                    .await?;
                let ids: Vec<Value> = links
                    .into_iter()
                    .filter_map(|r| r.get(&join.target_key).cloned())
                    .filter(|v| !v.is_null())
                    .collect();
                if ids.is_empty() {
                    return Ok(empty);
                }
                self.persistence
                    .find_by_columns(
                        target,
                        &filter(relation.remote_key.as_str(), Value::Array(ids)),
                        None,
                    )
                    .await?
            }
        };

        Ok(match relation.cardinality {
            Cardinality::One => rows.into_iter().next().map(Value::from).unwrap_or(Value::Null),
            Cardinality::Many => Value::Array(rows.into_iter().map(Value::from).collect()),
        })
    }

    /// One column of the row at `id`; no query when it is the primary key.
    async fn project_column(
        &self,
        entity: &EntityDescriptor,
        id: &Identifier,
        column: &str,
    ) -> Result<Value, FetchError> {
        if column == entity.primary_key() {
            return Ok(id.value().clone());
        }
        let rows = self
            .persistence
            .find_by_columns(
                entity,
                &filter(entity.primary_key(), id.value().clone()),
                Some(&[column.to_string()]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|r| r.get(column).cloned())
            .unwrap_or(Value::Null))
    }

    async fn cache_loaded(
        &self,
        entity: &EntityDescriptor,
        attribute: &AttributeDescriptor,
        record: &Record,
        loaded: &Value,
    ) {
        let id = identifier_for(entity, attribute, record);
        let Ok(key) = entity.attribute_key(attribute, id.as_ref()) else {
            return;
        };

        match &attribute.kind {
            AttributeKind::ToOne(relation) if relation.is_owning() => {
                if let Some(fk) = record.get(&relation.local_key) {
                    self.write_through(&key, fk).await;
                }
                let target = self.registry.entity(&relation.target);
                let target_id = target.and_then(|t| {
                    loaded
                        .get(t.primary_key())
                        .and_then(Identifier::from_value)
                        .map(|id| t.record_key(id))
                });
                if let Some(target_key) = target_id {
                    self.write_through(&target_key, loaded).await;
                }
            }
            _ => self.write_through(&key, loaded).await,
        }
    }
}

impl<S, P> Clone for Cacher<S, P>
where
    S: CacheStore,
    P: Persistence,
{
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            persistence: Arc::clone(&self.persistence),
            config: self.config.clone(),
        }
    }
}

fn require_id<'a>(
    entity: &EntityDescriptor,
    attribute: &AttributeDescriptor,
    id: Option<&'a Identifier>,
) -> Result<&'a Identifier, ConfigError> {
    id.ok_or_else(|| ConfigError::MissingIdentifier {
        entity: entity.name().to_string(),
        attribute: attribute.name.clone(),
    })
}

/// Identifier addressing `attribute` on `record`.
fn identifier_for(
    entity: &EntityDescriptor,
    attribute: &AttributeDescriptor,
    record: &Record,
) -> Option<Identifier> {
    match attribute.computed() {
        Some(computed) => computed
            .identifier_column
            .as_deref()
            .and_then(|column| record.identifier(column)),
        None => record.identifier(entity.primary_key()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryStore;
    use crate::cache::traits::CacheStats;
    use crate::persistence::InMemoryPersistence;
    use async_trait::async_trait;
    use relcache_core::{ComputedSpec, CountWhere, ExistsWhere, Predicate, RegistryBuilder};
    use serde_json::json;
    use std::time::Duration;

    // Store whose every operation fails.
    #[derive(Default)]
    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }

        async fn set(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }

        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable {
                reason: "down".into(),
            })
        }

        async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn stats(&self) -> Result<CacheStats, StoreError> {
            Ok(CacheStats::default())
        }
    }

    fn registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("User")
            .columns(["id", "name", "email", "language_id"])
            .belongs_to("language", "Language")
            .has_many("posts", "Post")
            .cached_attribute(
                ComputedSpec::new("email_valid", ExistsWhere::new(Predicate::identifier("email").and(Predicate::eq("name", "valid"))))
                    .keyed_by("email"),
            )
            .done()
            .unwrap();
        builder
            .add_entity("Post")
            .columns(["id", "user_id", "title"])
            .done()
            .unwrap();
        builder
            .add_entity("Language")
            .columns(["id", "name"])
            .done()
            .unwrap();
        builder
            .add_entity("Account")
            .columns(["id"])
            .cached_attribute(ComputedSpec::new("count", CountWhere::new(Predicate::All)).global())
            .done()
            .unwrap();
        Arc::new(builder.build().unwrap())
    }

    fn seeded() -> Arc<InMemoryPersistence> {
        let db = InMemoryPersistence::new();
        db.insert(
            "User",
            Record::new()
                .with("id", 1)
                .with("name", "john")
                .with("email", "john@example.com")
                .with("language_id", 2),
        )
        .unwrap();
        db.insert("Language", Record::new().with("id", 2).with("name", "zh-tw"))
            .unwrap();
        db.insert(
            "Post",
            Record::new().with("id", 1).with("user_id", 1).with("title", "a"),
        )
        .unwrap();
        Arc::new(db)
    }

    fn cacher(db: Arc<InMemoryPersistence>) -> Cacher<InMemoryStore, InMemoryPersistence> {
        Cacher::with_defaults(registry(), Arc::new(InMemoryStore::new()), db)
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_store() {
        let db = seeded();
        let cacher = cacher(db.clone());
        let id = Identifier::from(1);

        let posts = cacher.get("User", Some(&id), "posts").await.unwrap();
        assert_eq!(posts.as_array().map(Vec::len), Some(1));
        assert_eq!(db.query_count(), 1);

        let again = cacher.get("User", Some(&id), "posts").await.unwrap();
        assert_eq!(again, posts);
        assert_eq!(db.query_count(), 1);
    }

    #[tokio::test]
    async fn test_owning_relation_reads_through_target_record() {
        let db = seeded();
        let cacher = cacher(db.clone());
        let id = Identifier::from(1);

        let language = cacher.get("User", Some(&id), "language").await.unwrap();
        assert_eq!(language["name"], json!("zh-tw"));
        assert_eq!(db.query_count(), 2);

        let fk_key = CacheKey::attribute("User", "language_id", Some(id.clone()));
        assert_eq!(cacher.peek(&fk_key).await.unwrap(), CachedValue::Present(json!(2)));
        let target_key = CacheKey::record("Language", Identifier::from(2));
        assert!(!cacher.peek(&target_key).await.unwrap().is_absent());

        cacher.get("User", Some(&id), "language").await.unwrap();
        assert_eq!(db.query_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_record_caches_null_sentinel() {
        let db = seeded();
        let cacher = cacher(db.clone());
        let id = Identifier::from(404);

        assert_eq!(cacher.find("User", &id).await.unwrap(), None);
        assert_eq!(
            cacher.peek(&CacheKey::record("User", id.clone())).await.unwrap(),
            CachedValue::Null
        );
        assert_eq!(cacher.find("User", &id).await.unwrap(), None);
        assert_eq!(db.query_count(), 1);
    }

    #[tokio::test]
    async fn test_false_sentinel_for_email_keyed_attribute() {
        let db = seeded();
        let cacher = cacher(db.clone());
        let email = Identifier::from("john@example.com");

        let valid = cacher.get("User", Some(&email), "email_valid").await.unwrap();
        assert_eq!(valid, json!(false));
        let key = CacheKey::attribute("User", "email_valid", Some(email.clone()));
        assert_eq!(
            cacher.render(&key),
            "relcache_User_at_email_valid_john@example.com"
        );
        assert_eq!(cacher.peek(&key).await.unwrap(), CachedValue::False);

        cacher.get("User", Some(&email), "email_valid").await.unwrap();
        assert_eq!(db.query_count(), 1);
    }

    #[tokio::test]
    async fn test_global_attribute() {
        let db = seeded();
        db.insert("Account", Record::new().with("id", 1)).unwrap();
        let cacher = cacher(db.clone());

        assert_eq!(cacher.get("Account", None, "count").await.unwrap(), json!(1));
        let key = CacheKey::attribute("Account", "count", None);
        assert_eq!(cacher.render(&key), "relcache_Account_at_count");
        assert!(!cacher.peek(&key).await.unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_missing_identifier_is_config_error() {
        let cacher = cacher(seeded());
        let err = cacher.get("User", None, "posts").await.unwrap_err();
        assert!(matches!(
            err,
            relcache_core::RelcacheError::Config(ConfigError::MissingIdentifier { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_fetch() {
        let db = seeded();
        let cacher = Cacher::with_defaults(registry(), Arc::new(BrokenStore), db.clone());
        let id = Identifier::from(1);

        let name = cacher.get("User", Some(&id), "name").await.unwrap();
        assert_eq!(name, json!("john"));
        cacher.get("User", Some(&id), "name").await.unwrap();
        assert_eq!(db.query_count(), 2);

        assert!(matches!(
            cacher.clean("User", Some(&id), "name").await,
            Err(relcache_core::RelcacheError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_error_propagates_and_caches_nothing() {
        let db = seeded();
        let cacher = cacher(db.clone());
        let id = Identifier::from(1);
        db.set_unavailable(true);

        assert!(matches!(
            cacher.get("User", Some(&id), "posts").await,
            Err(relcache_core::RelcacheError::Fetch(FetchError::Unavailable { .. }))
        ));
        let key = CacheKey::attribute("User", "posts", Some(id));
        assert!(cacher.peek(&key).await.unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_call_dispatches_fetch_and_clean() {
        let cacher = cacher(seeded());
        let id = Identifier::from(1);

        assert!(matches!(
            cacher.call("User", Some(&id), "posts").await.unwrap(),
            CallOutcome::Fetched(Value::Array(_))
        ));
        assert_eq!(
            cacher.call("User", Some(&id), "clean_posts").await.unwrap(),
            CallOutcome::Cleaned(true)
        );
        assert_eq!(
            cacher.call("User", Some(&id), "clean_posts").await.unwrap(),
            CallOutcome::Cleaned(false)
        );
        assert!(cacher.call("User", Some(&id), "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_get_for_uses_loaded_association() {
        let db = seeded();
        let cacher = cacher(db.clone());
        let user = Instance::new(
            "User",
            Record::new().with("id", 1).with("language_id", 2),
        )
        .with_loaded("posts", json!([{"id": 9}]));

        let posts = cacher.get_for(&user, "posts").await.unwrap();
        assert_eq!(posts, json!([{"id": 9}]));
        assert_eq!(db.query_count(), 0);

        let key = CacheKey::attribute("User", "posts", Some(Identifier::from(1)));
        assert_eq!(
            cacher.peek(&key).await.unwrap(),
            CachedValue::Present(json!([{"id": 9}]))
        );
    }

    #[tokio::test]
    async fn test_get_for_reads_foreign_key_from_instance() {
        let db = seeded();
        let cacher = cacher(db.clone());
        let user = Instance::new(
            "User",
            Record::new().with("id", 1).with("language_id", 2),
        );

        let language = cacher.get_for(&user, "language").await.unwrap();
        assert_eq!(language["id"], json!(2));
        assert_eq!(db.query_count(), 1);
    }

    #[tokio::test]
    async fn test_clean_all_removes_record_and_attributes() {
        let cacher = cacher(seeded());
        let id = Identifier::from(1);
        cacher.find("User", &id).await.unwrap();
        cacher.get("User", Some(&id), "posts").await.unwrap();
        cacher.get("User", Some(&id), "name").await.unwrap();

        assert_eq!(cacher.clean_all("User", &id).await.unwrap(), 3);
        assert!(cacher.store().keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_is_passed_to_store() {
        let db = seeded();
        let cacher = Cacher::new(
            registry(),
            Arc::new(InMemoryStore::new()),
            db.clone(),
            CacherConfig::new().with_ttl(Duration::ZERO),
        );
        let id = Identifier::from(1);
        cacher.get("User", Some(&id), "name").await.unwrap();
        cacher.get("User", Some(&id), "name").await.unwrap();
        assert_eq!(db.query_count(), 2);
    }
}
