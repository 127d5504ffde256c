//! Cache key derivation.
//!
//! Keys render as `<namespace>_<Entity>[_<segment>][_<identifier>]`, where an
//! attribute segment is `at_<attribute>` and a lookup segment `by_<column>`:
//!
//! - record cache by primary key: `relcache_Profile_1`
//! - record cache by a lookup column: `relcache_Profile_by_token_tt9wav`
//! - attribute: `relcache_User_at_posts_1`
//! - identifier-less (global) attribute: `relcache_Account_at_count`
//!
//! The identifier is passed through verbatim, including characters such as
//! `@` or `-`. External tooling relies on this exact layout.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::Identifier;

/// Which cached fact about an entity a key names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeySegment {
    /// The whole record, addressed by primary key. Renders no segment.
    Record,
    /// The whole record, addressed by a unique non-primary column.
    RecordBy(String),
    /// A declared attribute (column, relation or computed value).
    Attribute(String),
}

/// Composite cache key: (entity, segment, identifier).
///
/// A key with no identifier names an identifier-independent aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    entity: String,
    segment: KeySegment,
    identifier: Option<Identifier>,
}

impl CacheKey {
    pub fn new(
        entity: impl Into<String>,
        segment: KeySegment,
        identifier: Option<Identifier>,
    ) -> Self {
        Self {
            entity: entity.into(),
            segment,
            identifier,
        }
    }

    /// Record cache addressed by primary key.
    pub fn record(entity: impl Into<String>, id: Identifier) -> Self {
        Self::new(entity, KeySegment::Record, Some(id))
    }

    /// Record cache addressed by a lookup column.
    pub fn record_by(entity: impl Into<String>, column: impl Into<String>, value: Identifier) -> Self {
        Self::new(entity, KeySegment::RecordBy(column.into()), Some(value))
    }

    /// Attribute cache; `None` for global attributes.
    pub fn attribute(
        entity: impl Into<String>,
        attribute: impl Into<String>,
        identifier: Option<Identifier>,
    ) -> Self {
        Self::new(entity, KeySegment::Attribute(attribute.into()), identifier)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn segment(&self) -> &KeySegment {
        &self.segment
    }

    pub fn identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    /// Render the store key under `namespace`.
    pub fn render(&self, namespace: &str) -> String {
        let mut out = String::with_capacity(namespace.len() + self.entity.len() + 16);
        out.push_str(namespace);
        out.push('_');
        out.push_str(&self.entity);
        match &self.segment {
            KeySegment::Record => {}
            KeySegment::RecordBy(column) => {
                out.push_str("_by_");
                out.push_str(column);
            }
            KeySegment::Attribute(name) => {
                out.push_str("_at_");
                out.push_str(name);
            }
        }
        if let Some(id) = &self.identifier {
            out.push('_');
            out.push_str(id.as_str());
        }
        out
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(crate::config::DEFAULT_NAMESPACE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_record_key_omits_segment() {
        let key = CacheKey::record("Profile", Identifier::from(-1));
        assert_eq!(key.render("relcache"), "relcache_Profile_-1");
    }

    #[test]
    fn test_record_by_key() {
        let key = CacheKey::record_by("Profile", "token", Identifier::from("tt9wav"));
        assert_eq!(key.render("relcache"), "relcache_Profile_by_token_tt9wav");
    }

    #[test]
    fn test_attribute_key_with_email_identifier() {
        let key = CacheKey::attribute(
            "User",
            "email_valid?",
            Some(Identifier::from("john2@example.com")),
        );
        assert_eq!(
            key.render("active_model_cachers"),
            "active_model_cachers_User_at_email_valid?_john2@example.com"
        );
    }

    #[test]
    fn test_global_attribute_omits_identifier() {
        let key = CacheKey::attribute("Account", "count", None);
        assert_eq!(key.render("relcache"), "relcache_Account_at_count");
        assert_eq!(key.to_string(), "relcache_Account_at_count");
    }

    #[test]
    fn test_same_id_different_entities_are_distinct() {
        let a = CacheKey::record("Profile", Identifier::from(-1));
        let b = CacheKey::record("Difficulty", Identifier::from(-1));
        assert_ne!(a, b);
        assert_ne!(a.render("ns"), b.render("ns"));
    }

    proptest! {
        #[test]
        fn prop_identifier_is_rendered_verbatim_at_the_end(id in "[a-zA-Z0-9@._+-]{1,24}") {
            let key = CacheKey::attribute("User", "posts", Some(Identifier::from(id.as_str())));
            let rendered = key.render("ns");
            prop_assert!(rendered.starts_with("ns_User_at_posts_"));
            prop_assert!(rendered.ends_with(&id));
            prop_assert_eq!(rendered.len(), "ns_User_at_posts_".len() + id.len());
        }
    }
}
