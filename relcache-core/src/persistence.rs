//! Persistence collaborator and computed-attribute seams.
//!
//! The cache never talks SQL. Everything it needs from the underlying
//! database goes through [`Persistence`]; declared aggregates produce their
//! values through [`AttributeComputer`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::entity::EntityDescriptor;
use crate::error::FetchError;
use crate::identity::{Identifier, Record};
use crate::registry::Registry;

/// Equality filters, ANDed. An array value means "column is one of".
pub type Filters = BTreeMap<String, Value>;

/// Build a single-column filter.
pub fn filter(column: impl Into<String>, value: impl Into<Value>) -> Filters {
    let mut filters = Filters::new();
    filters.insert(column.into(), value.into());
    filters
}

/// Query provider consumed by the cacher and the mutation hooks.
///
/// Implementations own connection handling, timeouts and cancellation;
/// their errors reach the caller unchanged.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load one record by primary key.
    async fn find_by_primary_key(
        &self,
        entity: &EntityDescriptor,
        id: &Identifier,
    ) -> Result<Option<Record>, FetchError>;

    /// Load records matching `filters`, optionally restricted to `projection`.
    async fn find_by_columns(
        &self,
        entity: &EntityDescriptor,
        filters: &Filters,
        projection: Option<&[String]>,
    ) -> Result<Vec<Record>, FetchError>;

    /// Count records satisfying `predicate`.
    async fn count_where(
        &self,
        entity: &EntityDescriptor,
        predicate: &Predicate,
    ) -> Result<u64, FetchError>;
}

/// Row predicate for aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Every row.
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
    Gt(String, Value),
    Lt(String, Value),
    /// Column equals the identifier the attribute is read at.
    EqIdentifier(String),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(column.into(), value.into())
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Self::NotNull(column.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    pub fn identifier(column: impl Into<String>) -> Self {
        Self::EqIdentifier(column.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            Self::All => other,
            first => Self::And(vec![first, other]),
        }
    }

    /// Replace every [`Predicate::EqIdentifier`] by an equality on `id`.
    ///
    /// Without an identifier the placeholder matches `null`, which matches
    /// no row.
    pub fn bind(&self, id: Option<&Identifier>) -> Predicate {
        match self {
            Self::EqIdentifier(column) => Self::Eq(
                column.clone(),
                id.map(|i| i.value().clone()).unwrap_or(Value::Null),
            ),
            Self::And(parts) => Self::And(parts.iter().map(|p| p.bind(id)).collect()),
            other => other.clone(),
        }
    }

    /// Evaluate against an in-memory record. Missing columns read as null.
    pub fn matches(&self, record: &Record) -> bool {
        let get = |c: &str| record.get(c).unwrap_or(&NULL);
        match self {
            Self::All => true,
            Self::Eq(c, v) => !v.is_null() && values_equal(get(c), v),
            Self::In(c, vs) => vs.iter().any(|v| values_equal(get(c), v)),
            Self::IsNull(c) => get(c).is_null(),
            Self::NotNull(c) => !get(c).is_null(),
            Self::Gt(c, v) => compare(get(c), v) == Some(Ordering::Greater),
            Self::Lt(c, v) => compare(get(c), v) == Some(Ordering::Less),
            // Unbound placeholders match nothing.
            Self::EqIdentifier(_) => false,
            Self::And(parts) => parts.iter().all(|p| p.matches(record)),
        }
    }
}

static NULL: Value = Value::Null;

/// Equality that treats `1` and `1.0` alike.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Everything a computed attribute may consult.
pub struct ComputeContext<'a> {
    pub persistence: &'a dyn Persistence,
    pub registry: &'a Registry,
    /// Entity declaring the attribute.
    pub entity: &'a EntityDescriptor,
    /// Identifier the attribute is read at; `None` for global attributes.
    pub identifier: Option<&'a Identifier>,
}

/// Value-producing function of a computed attribute.
#[async_trait]
pub trait AttributeComputer: Send + Sync + fmt::Debug {
    async fn compute(&self, ctx: ComputeContext<'_>) -> Result<Value, FetchError>;
}

/// Resolve the entity an aggregate counts over.
fn aggregate_target<'a>(
    ctx: &ComputeContext<'a>,
    over: Option<&str>,
) -> Result<&'a EntityDescriptor, FetchError> {
    match over {
        None => Ok(ctx.entity),
        Some(name) => ctx
            .registry
            .entity(name)
            .ok_or_else(|| FetchError::UnknownTable {
                entity: name.to_string(),
            }),
    }
}

/// `count(*)` over rows matching a predicate.
#[derive(Debug, Clone)]
pub struct CountWhere {
    over: Option<String>,
    predicate: Predicate,
}

impl CountWhere {
    /// Count rows of the declaring entity.
    pub fn new(predicate: Predicate) -> Self {
        Self {
            over: None,
            predicate,
        }
    }

    /// Count rows of another entity.
    pub fn over(entity: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            over: Some(entity.into()),
            predicate,
        }
    }
}

#[async_trait]
impl AttributeComputer for CountWhere {
    async fn compute(&self, ctx: ComputeContext<'_>) -> Result<Value, FetchError> {
        let target = aggregate_target(&ctx, self.over.as_deref())?;
        let predicate = self.predicate.bind(ctx.identifier);
        let count = ctx.persistence.count_where(target, &predicate).await?;
        Ok(Value::from(count))
    }
}

/// Whether any row matches a predicate.
#[derive(Debug, Clone)]
pub struct ExistsWhere {
    over: Option<String>,
    predicate: Predicate,
}

impl ExistsWhere {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            over: None,
            predicate,
        }
    }

    pub fn over(entity: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            over: Some(entity.into()),
            predicate,
        }
    }
}

#[async_trait]
impl AttributeComputer for ExistsWhere {
    async fn compute(&self, ctx: ComputeContext<'_>) -> Result<Value, FetchError> {
        let target = aggregate_target(&ctx, self.over.as_deref())?;
        let predicate = self.predicate.bind(ctx.identifier);
        let count = ctx.persistence.count_where(target, &predicate).await?;
        Ok(Value::Bool(count > 0))
    }
}
