//! Identifiers, records and in-memory instances.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Value that addresses a cache entry.
///
/// Normally a primary-key value, but any unique lookup value works (an email
/// address, a token). Identity is defined by the rendered form, which is the
/// exact text that lands in a cache key: `1` and `"1"` address the same entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct Identifier {
    value: Value,
    rendered: String,
}

impl Identifier {
    /// Build an identifier from a scalar JSON value.
    ///
    /// Returns `None` for null, arrays and objects, none of which can address
    /// a single entry.
    ///
    /// Integral floats (`1.0`) are normalised to integers so they address the
    /// same entry as the integer-typed column value.
    pub fn from_value(value: &Value) -> Option<Self> {
        let value = &normalize_number(value);
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => return None,
        };
        Some(Self {
            value: value.clone(),
            rendered,
        })
    }

    /// The JSON value used when querying persistence.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The verbatim text used in cache keys.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

fn normalize_number(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Value::from(f as i64)
            }
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

impl From<Value> for Identifier {
    fn from(value: Value) -> Self {
        Identifier::from_value(&value).unwrap_or_else(|| Self {
            rendered: value.to_string(),
            value,
        })
    }
}

impl From<Identifier> for Value {
    fn from(id: Identifier) -> Self {
        id.value
    }
}

impl From<i64> for Identifier {
    fn from(v: i64) -> Self {
        Self {
            value: Value::from(v),
            rendered: v.to_string(),
        }
    }
}

impl From<&str> for Identifier {
    fn from(v: &str) -> Self {
        Self {
            value: Value::from(v),
            rendered: v.to_string(),
        }
    }
}

impl From<String> for Identifier {
    fn from(v: String) -> Self {
        Self {
            value: Value::from(v.as_str()),
            rendered: v,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.rendered == other.rendered
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rendered.hash(state);
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rendered.cmp(&other.rendered)
    }
}

/// A row as seen by the cache: column name to JSON value.
///
/// A record may be partial (a projection); absence of a column means "not
/// loaded", not null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON object. Returns `None` for any other JSON shape.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Whether the column was loaded, whatever its value.
    pub fn has_column(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(column.into(), value)
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Columns holding a non-null value.
    pub fn present_columns(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k.as_str())
    }

    /// Identifier stored in `column`, if loaded and non-null.
    pub fn identifier(&self, column: &str) -> Option<Identifier> {
        self.fields.get(column).and_then(Identifier::from_value)
    }

    /// Copy of this record restricted to `columns` (missing columns skipped).
    pub fn project<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> Record {
        columns
            .into_iter()
            .filter_map(|c| self.fields.get(c).map(|v| (c.to_string(), v.clone())))
            .collect()
    }

    /// Overlay `other` onto this record; `other` wins on conflicts.
    pub fn merge(&mut self, other: &Record) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

/// A record held in memory by the caller, plus whatever associations the
/// caller already loaded.
///
/// The loaded set is an explicit capability: the cacher asks
/// [`Instance::is_loaded`] and never infers it from the record's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    entity: String,
    record: Record,
    loaded: BTreeMap<String, Value>,
}

impl Instance {
    pub fn new(entity: impl Into<String>, record: Record) -> Self {
        Self {
            entity: entity.into(),
            record,
            loaded: BTreeMap::new(),
        }
    }

    /// Mark an association (or computed attribute) as already loaded.
    pub fn with_loaded(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.loaded.insert(attribute.into(), value);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn is_loaded(&self, attribute: &str) -> bool {
        self.loaded.contains_key(attribute)
    }

    pub fn loaded_value(&self, attribute: &str) -> Option<&Value> {
        self.loaded.get(attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identifier_renders_verbatim() {
        assert_eq!(Identifier::from(-1).as_str(), "-1");
        assert_eq!(
            Identifier::from("john2@example.com").as_str(),
            "john2@example.com"
        );
        assert_eq!(Identifier::from(json!(42)), Identifier::from("42"));
    }

    #[test]
    fn test_integral_float_addresses_the_integer_entry() {
        let float = Identifier::from_value(&json!(1.0)).unwrap();
        assert_eq!(float, Identifier::from(1));
        assert_eq!(float.as_str(), "1");
        assert_eq!(float.value(), &json!(1));

        let fractional = Identifier::from_value(&json!(1.5)).unwrap();
        assert_eq!(fractional.as_str(), "1.5");
    }

    #[test]
    fn test_identifier_rejects_non_scalars() {
        assert!(Identifier::from_value(&Value::Null).is_none());
        assert!(Identifier::from_value(&json!([1])).is_none());
        assert!(Identifier::from_value(&json!({"id": 1})).is_none());
    }

    #[test]
    fn test_identifier_serde_is_the_raw_value() {
        let id = Identifier::from(7);
        assert_eq!(serde_json::to_value(&id).unwrap(), json!(7));
        let back: Identifier = serde_json::from_value(json!("a@b.c")).unwrap();
        assert_eq!(back.as_str(), "a@b.c");
    }

    #[test]
    fn test_record_projection_and_present_columns() {
        let record = Record::new()
            .with("id", 1)
            .with("title", "hello")
            .with("user_id", Value::Null);

        let projected = record.project(["id", "user_id", "missing"]);
        assert_eq!(projected.len(), 2);
        assert!(projected.has_column("user_id"));
        assert!(!projected.has_column("missing"));

        let present: Vec<_> = record.present_columns().collect();
        assert_eq!(present, vec!["id", "title"]);
        assert!(record.identifier("user_id").is_none());
    }

    #[test]
    fn test_instance_loaded_capability() {
        let instance = Instance::new("User", Record::new().with("id", 1))
            .with_loaded("posts", json!([]));
        assert!(instance.is_loaded("posts"));
        assert!(!instance.is_loaded("profile"));
        assert_eq!(instance.loaded_value("posts"), Some(&json!([])));
    }
}
