//! In-memory persistence adapter.
//!
//! Tables of [`Record`]s keyed by entity name, with a query log so tests can
//! assert exactly how many round trips a cache operation cost. Mutations
//! (`insert`, `update`, `remove`) are not queries and are never counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use relcache_core::{
    values_equal, EntityDescriptor, FetchError, Filters, Identifier, Persistence, Predicate,
    Record,
};
use serde_json::Value;

/// One logged round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    FindByPrimaryKey,
    FindByColumns,
    CountWhere,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogEntry {
    pub kind: QueryKind,
    pub entity: String,
}

/// Reference persistence backed by in-process tables.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    tables: RwLock<HashMap<String, Vec<Record>>>,
    log: RwLock<Vec<QueryLogEntry>>,
    unavailable: AtomicBool,
}

fn lock_error() -> FetchError {
    FetchError::Unavailable {
        reason: "table lock poisoned".to_string(),
    }
}

static NULL: Value = Value::Null;

fn matches_filters(record: &Record, filters: &Filters) -> bool {
    filters.iter().all(|(column, expected)| {
        let actual = record.get(column).unwrap_or(&NULL);
        match expected {
            Value::Array(options) => options.iter().any(|v| values_equal(actual, v)),
            single => values_equal(actual, single),
        }
    })
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row. Not logged as a query.
    pub fn insert(&self, entity: &str, record: Record) -> Result<(), FetchError> {
        self.tables
            .write()
            .map_err(|_| lock_error())?
            .entry(entity.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    /// Overlay `changes` onto the row whose `primary_key` equals `id`.
    /// Returns the row after the change.
    pub fn update(
        &self,
        entity: &str,
        primary_key: &str,
        id: &Identifier,
        changes: &Record,
    ) -> Result<Option<Record>, FetchError> {
        let mut tables = self.tables.write().map_err(|_| lock_error())?;
        let row = tables.get_mut(entity).and_then(|rows| {
            rows.iter_mut()
                .find(|r| r.identifier(primary_key).as_ref() == Some(id))
        });
        Ok(row.map(|r| {
            r.merge(changes);
            r.clone()
        }))
    }

    /// Delete every row matching `filters`. Returns the removed rows.
    pub fn remove(&self, entity: &str, filters: &Filters) -> Result<Vec<Record>, FetchError> {
        let mut tables = self.tables.write().map_err(|_| lock_error())?;
        let Some(rows) = tables.get_mut(entity) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<Record>, Vec<Record>) =
            rows.drain(..).partition(|r| matches_filters(r, filters));
        *rows = kept;
        Ok(removed)
    }

    /// Make every subsequent query fail with [`FetchError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of queries issued since the last reset.
    pub fn query_count(&self) -> usize {
        self.log.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn queries(&self) -> Vec<QueryLogEntry> {
        self.log.read().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn reset_queries(&self) {
        if let Ok(mut log) = self.log.write() {
            log.clear();
        }
    }

    fn begin(&self, kind: QueryKind, entity: &EntityDescriptor) -> Result<(), FetchError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable {
                reason: "persistence marked unavailable".to_string(),
            });
        }
        if let Ok(mut log) = self.log.write() {
            log.push(QueryLogEntry {
                kind,
                entity: entity.name().to_string(),
            });
        }
        Ok(())
    }

    fn scan<T>(
        &self,
        entity: &EntityDescriptor,
        f: impl FnOnce(&[Record]) -> T,
    ) -> Result<T, FetchError> {
        let tables = self.tables.read().map_err(|_| lock_error())?;
        let rows = tables.get(entity.name()).map(Vec::as_slice).unwrap_or(&[]);
        Ok(f(rows))
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn find_by_primary_key(
        &self,
        entity: &EntityDescriptor,
        id: &Identifier,
    ) -> Result<Option<Record>, FetchError> {
        self.begin(QueryKind::FindByPrimaryKey, entity)?;
        let pk = entity.primary_key();
        self.scan(entity, |rows| {
            rows.iter()
                .find(|r| r.identifier(pk).as_ref() == Some(id))
                .cloned()
        })
    }

    async fn find_by_columns(
        &self,
        entity: &EntityDescriptor,
        filters: &Filters,
        projection: Option<&[String]>,
    ) -> Result<Vec<Record>, FetchError> {
        self.begin(QueryKind::FindByColumns, entity)?;
        self.scan(entity, |rows| {
            rows.iter()
                .filter(|r| matches_filters(r, filters))
                .map(|r| match projection {
                    Some(columns) => r.project(columns.iter().map(String::as_str)),
                    None => r.clone(),
                })
                .collect()
        })
    }

    async fn count_where(
        &self,
        entity: &EntityDescriptor,
        predicate: &Predicate,
    ) -> Result<u64, FetchError> {
        self.begin(QueryKind::CountWhere, entity)?;
        self.scan(entity, |rows| {
            rows.iter().filter(|r| predicate.matches(r)).count() as u64
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relcache_core::{filter, RegistryBuilder};
    use serde_json::json;

    fn post_descriptor() -> relcache_core::Registry {
        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("Post")
            .columns(["id", "user_id", "title"])
            .done()
            .unwrap();
        builder.build().unwrap()
    }

    fn post(id: i64, user_id: i64, title: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("user_id", user_id)
            .with("title", title)
    }

    #[tokio::test]
    async fn test_find_and_count_are_logged() {
        let registry = post_descriptor();
        let posts = registry.require("Post").unwrap();
        let db = InMemoryPersistence::new();
        db.insert("Post", post(1, 1, "a")).unwrap();
        db.insert("Post", post(2, 1, "b")).unwrap();
        db.insert("Post", post(3, 2, "c")).unwrap();

        let found = db.find_by_primary_key(posts, &Identifier::from(2)).await.unwrap();
        assert_eq!(found.unwrap().get("title"), Some(&json!("b")));

        let rows = db
            .find_by_columns(posts, &filter("user_id", 1), Some(&["id".to_string()]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 1);

        let count = db
            .count_where(posts, &Predicate::eq("user_id", 2))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.query_count(), 3);
    }

    #[tokio::test]
    async fn test_membership_filter() {
        let registry = post_descriptor();
        let posts = registry.require("Post").unwrap();
        let db = InMemoryPersistence::new();
        for id in 1..=4 {
            db.insert("Post", post(id, id, "t")).unwrap();
        }
        let rows = db
            .find_by_columns(posts, &filter("id", json!([1, 3])), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_mutations_are_not_queries() {
        let db = InMemoryPersistence::new();
        db.insert("Post", post(1, 1, "a")).unwrap();
        let updated = db
            .update("Post", "id", &Identifier::from(1), &Record::new().with("title", "z"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("title"), Some(&json!("z")));
        assert_eq!(db.remove("Post", &filter("id", 1)).unwrap().len(), 1);
        assert_eq!(db.query_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let registry = post_descriptor();
        let posts = registry.require("Post").unwrap();
        let db = InMemoryPersistence::new();
        db.set_unavailable(true);
        let err = db
            .find_by_primary_key(posts, &Identifier::from(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unavailable { .. }));
    }
}
