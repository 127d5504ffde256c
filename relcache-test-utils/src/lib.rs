//! RELCACHE Test Utilities
//!
//! Shared test infrastructure for the relcache workspace:
//! - Proptest generators for identifiers, records and cached values
//! - The blog/membership fixture schema and seed data
//! - A harness wiring registry, store, persistence, cacher and hooks
//! - Custom assertions over query counts and store contents

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use relcache_core::{
    filter, AttributeComputer, CacheKey, CachedValue, CacherConfig, ComputeContext, ComputedSpec,
    ConfigError, CountWhere, ExistsWhere, FetchError, Identifier, Instance, InvalidationScope,
    LifecycleEvent, Persistence, Predicate, Record, Registry, RegistryBuilder, RelcacheError,
    RelcacheResult, StoreError,
};
pub use relcache_storage::{
    CacheStats, CacheStore, Cacher, InMemoryPersistence, InMemoryStore, Invalidation,
    MutationHooks,
};

/// Identifier shorthand.
pub fn id(value: i64) -> Identifier {
    Identifier::from(value)
}

// ============================================================================
// FLAKY STORE
// ============================================================================

/// In-memory store whose reads, writes and deletes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "flaky store".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Self::check(&self.fail_reads)?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Self::check(&self.fail_deletes)?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Self::check(&self.fail_reads)?;
        self.inner.exists(key).await
    }

    async fn stats(&self) -> Result<CacheStats, StoreError> {
        self.inner.stats().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest generators for relcache values.

    use super::*;
    use proptest::prelude::*;

    /// Integer or string identifier, strings may carry `@`, `.` and `-`.
    pub fn arb_identifier() -> impl Strategy<Value = Identifier> {
        prop_oneof![
            any::<i64>().prop_map(Identifier::from),
            "[a-z0-9][a-z0-9@.\\-]{0,15}".prop_map(Identifier::from),
        ]
    }

    pub fn arb_namespace() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,11}"
    }

    pub fn arb_entity_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,9}"
    }

    /// Scalar JSON value, null and `false` included.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,20}".prop_map(Value::from),
        ]
    }

    /// Any value a fetch may produce: scalars, arrays of scalars and objects.
    pub fn arb_fetched_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            4 => arb_scalar(),
            1 => prop::collection::vec(arb_scalar(), 0..4).prop_map(Value::Array),
            1 => arb_record().prop_map(Value::from),
        ]
    }

    /// A row of up to four columns.
    pub fn arb_record() -> impl Strategy<Value = Record> {
        prop::collection::btree_map("[a-z_]{1,8}", arb_scalar(), 0..4)
            .prop_map(|fields| fields.into_iter().collect())
    }

    pub fn arb_lifecycle_event() -> impl Strategy<Value = LifecycleEvent> {
        prop_oneof![
            Just(LifecycleEvent::Create),
            Just(LifecycleEvent::Update),
            Just(LifecycleEvent::Destroy),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! The blog/membership schema used across the integration tests.
    //!
    //! - `User` belongs to a `Language`, has many `Post`s and one `Profile`;
    //!   `email_valid` is addressed by email and is `false` until the user
    //!   confirms. `posts_count` expires through `posts` on create and destroy
    //!   only.
    //! - `Profile` is also cached by `token`.
    //! - `Group` has many `Member`s through `Membership`; `member_count`
    //!   expires through `members`.
    //! - `Account.count` and `Customer.active_count` are global aggregates,
    //!   the latter only sensitive to `last_login_at`.
    //! - `Order` belongs to a `Customer`; `customer_name` expires through
    //!   `customer` when the customer's `name` changes.
    //! - `Difficulty` exists to share identifiers with `Profile`.

    use super::*;

    /// Declare the fixture schema on `builder`.
    pub fn declare(builder: &mut RegistryBuilder) -> Result<(), ConfigError> {
        builder
            .add_entity("Language")
            .columns(["id", "name"])
            .done()?;
        builder
            .add_entity("User")
            .columns(["id", "name", "email", "language_id", "confirmed_at"])
            .belongs_to("language", "Language")
            .has_many("posts", "Post")
            .has_one("profile", "Profile")
            .cached_attribute(
                ComputedSpec::new(
                    "email_valid",
                    ExistsWhere::new(
                        Predicate::identifier("email").and(Predicate::not_null("confirmed_at")),
                    ),
                )
                .keyed_by("email"),
            )
            .cached_attribute(
                ComputedSpec::new(
                    "posts_count",
                    CountWhere::over("Post", Predicate::identifier("user_id")),
                )
                .expire_by("posts")
                .on([LifecycleEvent::Create, LifecycleEvent::Destroy]),
            )
            .done()?;
        builder
            .add_entity("Post")
            .columns(["id", "user_id", "title"])
            .belongs_to("user", "User")
            .done()?;
        builder
            .add_entity("Profile")
            .columns(["id", "user_id", "token", "point"])
            .cache_by("token")
            .done()?;
        builder
            .add_entity("Group")
            .columns(["id", "name"])
            .has_many_through("members", "Member", "Membership")
            .cached_attribute(
                ComputedSpec::new(
                    "member_count",
                    CountWhere::over("Membership", Predicate::identifier("group_id")),
                )
                .expire_by("members"),
            )
            .done()?;
        builder
            .add_entity("Membership")
            .columns(["id", "group_id", "member_id"])
            .done()?;
        builder
            .add_entity("Member")
            .columns(["id", "name", "nickname"])
            .done()?;
        builder
            .add_entity("Account")
            .columns(["id", "name"])
            .cached_attribute(
                ComputedSpec::new("count", CountWhere::new(Predicate::All))
                    .global()
                    .expire_by("Account"),
            )
            .done()?;
        builder
            .add_entity("Customer")
            .columns(["id", "name", "last_login_at"])
            .cached_attribute(
                ComputedSpec::new(
                    "active_count",
                    CountWhere::new(Predicate::not_null("last_login_at")),
                )
                .global()
                .expire_by_columns("Customer", ["last_login_at"]),
            )
            .done()?;
        builder
            .add_entity("Order")
            .columns(["id", "customer_id", "total"])
            .belongs_to("customer", "Customer")
            .cached_attribute(
                ComputedSpec::new(
                    "customer_name",
                    ReferencedColumn::new("customer_id", "Customer", "name"),
                )
                .expire_by_columns("customer", ["name"]),
            )
            .done()?;
        builder
            .add_entity("Difficulty")
            .columns(["id", "name"])
            .done()?;
        Ok(())
    }

    /// Column of the row a to-one foreign key points at.
    #[derive(Debug, Clone)]
    pub struct ReferencedColumn {
        foreign_key: String,
        target: String,
        column: String,
    }

    impl ReferencedColumn {
        pub fn new(foreign_key: &str, target: &str, column: &str) -> Self {
            Self {
                foreign_key: foreign_key.to_string(),
                target: target.to_string(),
                column: column.to_string(),
            }
        }
    }

    #[async_trait]
    impl AttributeComputer for ReferencedColumn {
        async fn compute(&self, ctx: ComputeContext<'_>) -> Result<Value, FetchError> {
            let Some(row_id) = ctx.identifier else {
                return Ok(Value::Null);
            };
            let Some(row) = ctx.persistence.find_by_primary_key(ctx.entity, row_id).await? else {
                return Ok(Value::Null);
            };
            let Some(target_id) = row.identifier(&self.foreign_key) else {
                return Ok(Value::Null);
            };
            let target = ctx
                .registry
                .entity(&self.target)
                .ok_or_else(|| FetchError::UnknownTable {
                    entity: self.target.clone(),
                })?;
            Ok(ctx
                .persistence
                .find_by_primary_key(target, &target_id)
                .await?
                .and_then(|target_row| target_row.get(&self.column).cloned())
                .unwrap_or(Value::Null))
        }
    }

    /// The fixture registry. Panics if the fixture schema stops building.
    pub fn registry() -> Registry {
        let mut builder = RegistryBuilder::new();
        declare(&mut builder).expect("fixture schema declares");
        builder.build().expect("fixture schema builds")
    }

    pub fn language(id: i64, name: &str) -> Record {
        Record::new().with("id", id).with("name", name)
    }

    pub fn user(id: i64, name: &str, language_id: Option<i64>) -> Record {
        Record::new()
            .with("id", id)
            .with("name", name)
            .with("email", format!("{name}@example.com"))
            .with("language_id", language_id.map(Value::from).unwrap_or(Value::Null))
            .with("confirmed_at", Value::Null)
    }

    pub fn post(id: i64, user_id: i64, title: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("user_id", user_id)
            .with("title", title)
    }

    pub fn profile(id: i64, user_id: i64, token: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("user_id", user_id)
            .with("token", token)
            .with("point", 0)
    }

    pub fn group(id: i64, name: &str) -> Record {
        Record::new().with("id", id).with("name", name)
    }

    pub fn member(id: i64, name: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("name", name)
            .with("nickname", Value::Null)
    }

    pub fn membership(id: i64, group_id: i64, member_id: i64) -> Record {
        Record::new()
            .with("id", id)
            .with("group_id", group_id)
            .with("member_id", member_id)
    }

    pub fn account(id: i64) -> Record {
        Record::new().with("id", id).with("name", format!("account-{id}"))
    }

    pub fn customer(id: i64, name: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("name", name)
            .with("last_login_at", Value::Null)
    }

    pub fn order(id: i64, customer_id: i64, total: i64) -> Record {
        Record::new()
            .with("id", id)
            .with("customer_id", customer_id)
            .with("total", total)
    }

    pub fn difficulty(id: i64, name: &str) -> Record {
        Record::new().with("id", id).with("name", name)
    }

    /// Seed the standard data set.
    ///
    /// - Languages 1 (en) and 2 (zh-tw); users 1 (john2, en) and 2 (pearl, none)
    /// - Posts 1..=3 by user 1, post 4 by user 2
    /// - Profile 1 of user 1 with token `tt9wav`
    /// - Group 1 with members 1 and 2, group 2 with member 3
    /// - Accounts 1..=4
    /// - Customers 1 and 2, order 1 of customer 1
    pub fn seed(db: &InMemoryPersistence) -> Result<(), FetchError> {
        db.insert("Language", language(1, "en"))?;
        db.insert("Language", language(2, "zh-tw"))?;
        db.insert("User", user(1, "john2", Some(1)))?;
        db.insert("User", user(2, "pearl", None))?;
        for (post_id, title) in [(1, "first"), (2, "second"), (3, "third")] {
            db.insert("Post", post(post_id, 1, title))?;
        }
        db.insert("Post", post(4, 2, "other"))?;
        db.insert("Profile", profile(1, 1, "tt9wav"))?;
        db.insert("Group", group(1, "rustaceans"))?;
        db.insert("Group", group(2, "gophers"))?;
        for (member_id, name) in [(1, "ann"), (2, "bob"), (3, "cid")] {
            db.insert("Member", member(member_id, name))?;
        }
        db.insert("Membership", membership(1, 1, 1))?;
        db.insert("Membership", membership(2, 1, 2))?;
        db.insert("Membership", membership(3, 2, 3))?;
        for account_id in 1..=4 {
            db.insert("Account", account(account_id))?;
        }
        db.insert("Customer", customer(1, "acme"))?;
        db.insert("Customer", customer(2, "globex"))?;
        db.insert("Order", order(1, 1, 250))?;
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Registry, store, persistence, cacher and hooks wired together.
///
/// The mutation helpers play the ORM: they run the before phase, apply the
/// change to the in-memory tables and run the after phase.
pub struct Harness<S: CacheStore = InMemoryStore> {
    pub registry: Arc<Registry>,
    pub store: Arc<S>,
    pub db: Arc<InMemoryPersistence>,
    pub hooks: MutationHooks<S, InMemoryPersistence>,
}

impl Harness<InMemoryStore> {
    /// Fixture schema, seeded data, empty in-memory store, zeroed query log.
    pub fn seeded() -> Self {
        Self::with_store(InMemoryStore::new(), CacherConfig::default())
    }
}

impl<S: CacheStore> Harness<S> {
    pub fn with_store(store: S, config: CacherConfig) -> Self {
        let registry = Arc::new(fixtures::registry());
        let db = Arc::new(InMemoryPersistence::new());
        fixtures::seed(&db).expect("fixture data seeds");
        let store = Arc::new(store);
        let cacher = Cacher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&db),
            config,
        );
        Self {
            registry,
            store,
            db,
            hooks: MutationHooks::new(cacher),
        }
    }

    pub fn cacher(&self) -> &Cacher<S, InMemoryPersistence> {
        self.hooks.cacher()
    }

    /// Rendered form of `key` under the configured namespace.
    pub fn render(&self, key: &CacheKey) -> String {
        self.cacher().render(key)
    }

    /// Sentinel-level view of `key`.
    pub async fn peek(&self, key: &CacheKey) -> CachedValue {
        self.cacher().peek(key).await.expect("store readable")
    }

    pub async fn is_cached(&self, key: &CacheKey) -> bool {
        !self.peek(key).await.is_absent()
    }

    /// Insert `record` as a new row.
    pub async fn create(&self, entity: &str, record: Record) -> RelcacheResult<Invalidation> {
        let pending = self.hooks.before_create(entity).await?;
        self.db.insert(entity, record.clone())?;
        self.hooks.after_commit(pending, Some(&record)).await
    }

    /// Save `changes` onto the row the caller holds as `record`.
    ///
    /// `record` may be partial, the way a projected ORM instance is.
    pub async fn update(
        &self,
        entity: &str,
        record: &Record,
        changes: Record,
    ) -> RelcacheResult<Invalidation> {
        let descriptor = self.registry.require(entity)?;
        let pk = descriptor.primary_key().to_string();
        let row_id = record
            .identifier(&pk)
            .ok_or_else(|| ConfigError::MissingIdentifier {
                entity: entity.to_string(),
                attribute: pk.clone(),
            })?;

        let pending = self.hooks.before_update(entity, record).await?;
        self.db.update(entity, &pk, &row_id, &changes)?;
        let mut after = record.clone();
        after.merge(&changes);
        self.hooks.after_commit(pending, Some(&after)).await
    }

    /// Destroy the row the caller holds as `record`.
    pub async fn destroy(&self, entity: &str, record: &Record) -> RelcacheResult<Invalidation> {
        let descriptor = self.registry.require(entity)?;
        let pk = descriptor.primary_key().to_string();
        let pending = self.hooks.before_destroy(entity, record).await?;
        if let Some(value) = record.get(&pk) {
            self.db.remove(entity, &filter(pk.as_str(), value.clone()))?;
        }
        self.hooks.after_commit(pending, None).await
    }

    /// Delete by primary key without loading the row.
    pub async fn delete(&self, entity: &str, row_id: &Identifier) -> RelcacheResult<Invalidation> {
        let descriptor = self.registry.require(entity)?;
        let pk = descriptor.primary_key().to_string();
        let pending = self.hooks.before_delete(entity, row_id).await?;
        self.db
            .remove(entity, &filter(pk.as_str(), row_id.value().clone()))?;
        self.hooks.after_commit(pending, None).await
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over query counts and store contents.

    use super::*;

    /// Assert exactly `expected` queries were issued since the log stood at
    /// `before`.
    #[track_caller]
    pub fn assert_query_count(db: &InMemoryPersistence, before: usize, expected: usize) {
        let issued = db.query_count() - before;
        assert_eq!(
            issued, expected,
            "Expected {expected} queries, got {issued}: {:?}",
            db.queries()
        );
    }

    /// Assert the live keys of `store` are exactly `expected` (rendered).
    #[track_caller]
    pub fn assert_store_keys(store: &InMemoryStore, expected: &[&str]) {
        let mut expected: Vec<String> = expected.iter().map(|k| k.to_string()).collect();
        expected.sort();
        let keys = store.keys().expect("store readable");
        assert_eq!(keys, expected, "Unexpected store contents");
    }

    #[track_caller]
    pub fn assert_cleaned(report: &Invalidation, key: &CacheKey) {
        assert!(
            report.contains(key),
            "Expected {key} to be invalidated, got {:?}",
            report.keys.keys().map(ToString::to_string).collect::<Vec<_>>()
        );
    }

    #[track_caller]
    pub fn assert_not_cleaned(report: &Invalidation, key: &CacheKey) {
        assert!(
            !report.contains(key),
            "Expected {key} to survive, got {:?}",
            report.keys.keys().map(ToString::to_string).collect::<Vec<_>>()
        );
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &RelcacheResult<T>) {
        match result {
            Err(RelcacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &RelcacheResult<T>) {
        match result {
            Err(RelcacheError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }
}

/// Count queries issued by an async block.
///
/// ```ignore
/// let (value, queries) = count_queries!(h.db, h.cacher().get("User", Some(&id(1)), "posts"));
/// ```
#[macro_export]
macro_rules! count_queries {
    ($db:expr, $fut:expr) => {{
        let before = $db.query_count();
        let value = $fut.await;
        (value, $db.query_count() - before)
    }};
}

// ============================================================================
// TESTS
// ============================================================================
