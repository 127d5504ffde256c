//! Before-phase snapshot of a row about to change.

use relcache_core::{filter, EntityDescriptor, FetchError, Identifier, Persistence, Record, Registry};
use tracing::{debug, trace};

/// Capture the tracked columns of a row before it changes.
///
/// Columns already present on `record` are taken as they are; the rest are
/// loaded with a single projection query. Without a record, the row is
/// loaded by `id`. Returns `None` when there is no such row.
pub async fn capture(
    persistence: &dyn Persistence,
    registry: &Registry,
    entity: &EntityDescriptor,
    record: Option<&Record>,
    id: Option<&Identifier>,
) -> Result<Option<Record>, FetchError> {
    let mut snapshot = record.cloned().unwrap_or_default();
    let missing: Vec<String> = registry
        .tracked_columns(entity.name())
        .filter(|column| !snapshot.has_column(column))
        .map(str::to_string)
        .collect();
    if missing.is_empty() && record.is_some() {
        return Ok(Some(snapshot));
    }

    let pk = entity.primary_key();
    let Some(id) = id.cloned().or_else(|| snapshot.identifier(pk)) else {
        trace!(entity = entity.name(), "no primary key, snapshot left partial");
        return Ok(record.cloned());
    };

    debug!(entity = entity.name(), columns = ?missing, "projecting tracked columns");
    let row = persistence
        .find_by_columns(entity, &filter(pk, id.value().clone()), Some(&missing))
        .await?
        .into_iter()
        .next();

    Ok(match row {
        Some(row) => {
            snapshot.merge(&row);
            Some(snapshot)
        }
        None if record.is_some() => Some(snapshot),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use relcache_core::RegistryBuilder;
    use serde_json::json;

    fn registry() -> Registry {
        let mut builder = RegistryBuilder::new();
        builder
            .add_entity("Post")
            .columns(["id", "user_id", "title"])
            .done()
            .unwrap();
        builder.build().unwrap()
    }

    fn db() -> InMemoryPersistence {
        let db = InMemoryPersistence::new();
        db.insert(
            "Post",
            Record::new().with("id", 1).with("user_id", 7).with("title", "a"),
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_complete_record_needs_no_query() {
        let registry = registry();
        let db = db();
        let post = Record::new().with("id", 1).with("user_id", 7).with("title", "a");
        let snapshot = capture(&db, &registry, registry.require("Post").unwrap(), Some(&post), None)
            .await
            .unwrap();
        assert_eq!(snapshot, Some(post));
        assert_eq!(db.query_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_record_projects_missing_columns() {
        let registry = registry();
        let db = db();
        let partial = Record::new().with("id", 1).with("title", "a");
        let snapshot = capture(&db, &registry, registry.require("Post").unwrap(), Some(&partial), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.get("user_id"), Some(&json!(7)));
        assert_eq!(db.query_count(), 1);
    }

    #[tokio::test]
    async fn test_by_id_and_missing_row() {
        let registry = registry();
        let db = db();
        let posts = registry.require("Post").unwrap();

        let found = capture(&db, &registry, posts, None, Some(&Identifier::from(1)))
            .await
            .unwrap();
        assert_eq!(found.unwrap().len(), 3);

        let gone = capture(&db, &registry, posts, None, Some(&Identifier::from(2)))
            .await
            .unwrap();
        assert!(gone.is_none());
        assert_eq!(db.query_count(), 2);
    }
}
