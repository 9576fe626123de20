//! Intent core types: declarative resource objects and their store records.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod identity;

pub use identity::{parse_gvk_key, GroupVersion, OrgScope, ResourceIdentity};

/// Dynamic spec fields, keyed by field name.
pub type Spec = BTreeMap<String, serde_json::Value>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("invalid {field} {value:?}: {reason}")]
    Invalid { field: String, value: String, reason: String },
    #[error("schema: {0}")]
    Schema(String),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid { field: field.into(), value: value.into(), reason: reason.into() }
    }
}

/// Opaque, totally ordered version token. Changes on every accepted mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct ResourceVersion(pub u64);

impl ResourceVersion {
    /// Carried by drafts that were never accepted.
    pub const UNSET: ResourceVersion = ResourceVersion(0);

    pub fn is_unset(&self) -> bool { *self == Self::UNSET }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

impl std::str::FromStr for ResourceVersion {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| ValidationError::invalid("resourceVersion", s, "expected a decimal token"))
    }
}

/// In-memory representation of a declarative resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceObject {
    pub identity: ResourceIdentity,
    pub spec: Spec,
    pub resource_version: ResourceVersion,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis
    pub updated_at: i64,
}

impl ResourceObject {
    /// A draft: version unset and timestamps zero until the bridge accepts it.
    pub fn new(identity: ResourceIdentity, spec: Spec) -> Self {
        Self { identity, spec, resource_version: ResourceVersion::UNSET, created_at: 0, updated_at: 0 }
    }

    pub fn same_spec(&self, other: &ResourceObject) -> bool { self.spec == other.spec }
}

/// Backing-store row. The surrogate key never leaves the store adapter's callers
/// on the declarative side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreRecord {
    pub surrogate_key: i64,
    pub org_scope: OrgScope,
    pub identity: ResourceIdentity,
    pub resource_version: ResourceVersion,
    /// Flattened spec: nested objects are joined with `.`
    pub fields: BTreeMap<String, serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub mod prelude {
    pub use super::{
        GroupVersion, OrgScope, ResourceIdentity, ResourceObject, ResourceVersion, Spec, StoreRecord, ValidationError,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_and_parse() {
        let a: ResourceVersion = "41".parse().unwrap();
        let b = ResourceVersion(42);
        assert!(a < b);
        assert_eq!(b.to_string(), "42");
        assert!("x1".parse::<ResourceVersion>().is_err());
        assert!(ResourceVersion::default().is_unset());
    }

    #[test]
    fn object_equality_is_field_level() {
        let id = ResourceIdentity::new("", "v1", "Thing", "default", "a").unwrap();
        let mut spec = Spec::new();
        spec.insert("url".into(), serde_json::json!("http://localhost:1111"));
        let a = ResourceObject::new(id.clone(), spec.clone());
        let mut b = ResourceObject::new(id, spec);
        assert_eq!(a, b);
        b.resource_version = ResourceVersion(3);
        assert_ne!(a, b);
        assert!(a.same_spec(&b));
    }
}
