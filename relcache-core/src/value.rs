//! Cached value envelope and sentinels.
//!
//! A plain store cannot tell "missing" from "stored null" or "stored false".
//! Every write therefore goes through [`CachedValue`], whose stored form is a
//! tagged envelope: a domain value can never be mistaken for a sentinel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// What a cache lookup found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    /// Never cached (or expired, or cleaned). Never written to a store.
    Absent,
    /// Looked up; the result was null / not found.
    Null,
    /// Looked up; the result was boolean `false`.
    False,
    /// Looked up; the real value.
    Present(Value),
}

/// On-store representation. `Absent` has no stored form.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
enum Envelope {
    #[serde(rename = "nil")]
    Null,
    #[serde(rename = "false")]
    False,
    #[serde(rename = "val")]
    Present(Value),
}

impl CachedValue {
    /// Wrap a freshly fetched value, replacing null/false by their sentinels.
    pub fn wrap(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(false) => Self::False,
            other => Self::Present(other),
        }
    }

    /// Unwrap into the real value; `None` only for [`CachedValue::Absent`].
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Absent => None,
            Self::Null => Some(Value::Null),
            Self::False => Some(Value::Bool(false)),
            Self::Present(v) => Some(v),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Encode for the store. Returns `None` for `Absent`, which is never stored.
    pub fn encode(&self) -> Option<Vec<u8>> {
        let envelope = match self {
            Self::Absent => return None,
            Self::Null => Envelope::Null,
            Self::False => Envelope::False,
            Self::Present(v) => Envelope::Present(v.clone()),
        };
        // Serializing a JSON value into a Vec cannot fail.
        serde_json::to_vec(&envelope).ok()
    }

    /// Decode bytes read from the store at `key`.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| StoreError::Codec {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(match envelope {
            Envelope::Null => Self::Null,
            Envelope::False => Self::False,
            Envelope::Present(v) => Self::Present(v),
        })
    }
}
