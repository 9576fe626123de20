//! Declarative identity: group/version/kind plus namespace/name.

#![forbid(unsafe_code)]

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_NAME_LEN: usize = 253;

static DNS_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").expect("static regex"));
static KIND: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*$").expect("static regex"));
static VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^v[0-9]+((alpha|beta)[0-9]+)?$").expect("static regex"));

/// Identity of a declarative resource. Immutable once the object exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let id = Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        };
        id.validate()?;
        Ok(id)
    }

    /// Re-check the lexical rules, e.g. after deserializing from an untrusted source.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_required("version", &self.version)?;
        check_required("kind", &self.kind)?;
        check_required("namespace", &self.namespace)?;
        check_required("name", &self.name)?;
        if !self.group.is_empty() {
            check_dns("group", &self.group)?;
        }
        if !VERSION.is_match(&self.version) {
            return Err(ValidationError::invalid("version", &self.version, "expected v<N>[alpha<N>|beta<N>]"));
        }
        if !KIND.is_match(&self.kind) {
            return Err(ValidationError::invalid("kind", &self.kind, "expected an alphanumeric CamelCase kind"));
        }
        check_dns("namespace", &self.namespace)?;
        check_dns("name", &self.name)?;
        Ok(())
    }

    /// `namespace/name`; unique within one group/version/kind.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// `group/version/Kind`, or `version/Kind` for the core group.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// Stable serialization key used for identity comparison across components.
    pub fn full_key(&self) -> String {
        format!("{}/{}", self.gvk_key(), self.key())
    }

    pub fn group_version(&self) -> GroupVersion {
        GroupVersion { group: self.group.clone(), version: self.version.clone() }
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_key())
    }
}

/// A group/version pair; the unit a convergence sweep lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl std::fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() { f.write_str(&self.version) } else { write!(f, "{}/{}", self.group, self.version) }
    }
}

/// Parse `v1/Kind` or `group/v1/Kind` into `(group, version, kind)`.
pub fn parse_gvk_key(key: &str) -> Result<(String, String, String), ValidationError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok((String::new(), (*version).to_string(), (*kind).to_string())),
        [group, version, kind] => Ok(((*group).to_string(), (*version).to_string(), (*kind).to_string())),
        _ => Err(ValidationError::invalid("gvk", key, "expect v1/Kind or group/v1/Kind")),
    }
}

/// Org scoping of the relational store, derived from the namespace.
///
/// `default` is org 1; `org-<n>` is org n. Other namespaces have no org.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OrgScope(pub i64);

impl OrgScope {
    pub const DEFAULT: OrgScope = OrgScope(1);

    pub fn from_namespace(ns: &str) -> Result<Self, ValidationError> {
        if ns == "default" {
            return Ok(Self::DEFAULT);
        }
        match ns.strip_prefix("org-").and_then(|n| n.parse::<i64>().ok()) {
            Some(id) if id >= 1 => Ok(Self(id)),
            _ => Err(ValidationError::invalid("namespace", ns, "expected `default` or `org-<id>`")),
        }
    }

    pub fn namespace(&self) -> String {
        if *self == Self::DEFAULT { "default".to_string() } else { format!("org-{}", self.0) }
    }
}

fn check_required(field: &'static str, v: &str) -> Result<(), ValidationError> {
    if v.is_empty() { Err(ValidationError::Empty(field)) } else { Ok(()) }
}

fn check_dns(field: &'static str, v: &str) -> Result<(), ValidationError> {
    if v.len() > MAX_NAME_LEN {
        return Err(ValidationError::invalid(field, v, "longer than 253 characters"));
    }
    if !DNS_NAME.is_match(v) {
        return Err(ValidationError::invalid(field, v, "must be lowercase alphanumeric, '-' or '.'"));
    }
    Ok(())
}
