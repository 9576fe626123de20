//! Intent schema: declared spec fields per kind, and validation against them.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use intent_core::{GroupVersion, ResourceObject, Spec, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DATASOURCE_GROUP: &str = "datasource.core.intent.dev";
pub const DATASOURCE_VERSION: &str = "v1alpha1";
pub const DATASOURCE_KIND: &str = "Datasource";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Bool,
    Integer,
    Object,
}

impl FieldType {
    fn accepts(&self, v: &Value) -> bool {
        match self {
            FieldType::String => v.is_string(),
            FieldType::Bool => v.is_boolean(),
            FieldType::Integer => v.is_i64() || v.is_u64(),
            FieldType::Object => v.is_object(),
        }
    }

    fn from_openapi(ty: &str) -> Option<Self> {
        match ty {
            "string" => Some(FieldType::String),
            "boolean" => Some(FieldType::Bool),
            "integer" => Some(FieldType::Integer),
            "object" => Some(FieldType::Object),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, ty: FieldType) -> Self { Self { name: name.to_string(), ty, required: true } }
    pub fn optional(name: &str, ty: FieldType) -> Self { Self { name: name.to_string(), ty, required: false } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaFlags {
    /// Accept spec fields the schema does not declare.
    #[serde(default)]
    pub preserves_unknown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindSchema {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub flags: SchemaFlags,
}

impl KindSchema {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn validate(&self, spec: &Spec) -> Result<(), ValidationError> {
        for (name, v) in spec.iter() {
            if name.is_empty() || name.contains('.') {
                return Err(ValidationError::invalid("spec", name, "field names must be non-empty and contain no '.'"));
            }
            match self.fields.iter().find(|f| &f.name == name) {
                Some(f) => {
                    if !f.ty.accepts(v) {
                        return Err(ValidationError::Schema(format!(
                            "{}: field {} expects {:?}, got {}",
                            self.gvk_key(), name, f.ty, type_name(v)
                        )));
                    }
                }
                None if self.flags.preserves_unknown => {}
                None => return Err(ValidationError::Schema(format!("{}: unknown field {}", self.gvk_key(), name))),
            }
            if let Some(bad) = dotted_key(name, v) {
                return Err(ValidationError::invalid("spec", bad, "nested keys must be non-empty and contain no '.'"));
            }
        }
        for f in self.fields.iter().filter(|f| f.required) {
            if !spec.contains_key(&f.name) {
                return Err(ValidationError::Schema(format!("{}: missing required field {}", self.gvk_key(), f.name)));
            }
        }
        Ok(())
    }

    /// Derive a schema from an OpenAPI v3 object schema describing `spec`.
    /// Only top-level scalar and object properties are kept; other types are skipped.
    pub fn from_openapi(group: &str, version: &str, kind: &str, schema: &Value) -> Result<Self, ValidationError> {
        let props = schema
            .get("properties")
            .and_then(|p| p.as_object())
            .ok_or_else(|| ValidationError::Schema(format!("{}/{}: schema has no properties", version, kind)))?;
        let required: Vec<&str> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str()).collect())
            .unwrap_or_default();
        let mut fields = Vec::with_capacity(props.len());
        for (name, prop) in props.iter() {
            let Some(ty) = prop.get("type").and_then(|t| t.as_str()).and_then(FieldType::from_openapi) else {
                debug!(field = %name, "skipping property with unsupported type");
                continue;
            };
            fields.push(FieldSpec { name: name.clone(), ty, required: required.contains(&name.as_str()) });
        }
        let preserves_unknown = schema
            .get("x-kubernetes-preserve-unknown-fields")
            .and_then(|b| b.as_bool())
            .unwrap_or(false);
        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            fields,
            flags: SchemaFlags { preserves_unknown },
        })
    }
}

/// First nested object key that would make the flattened field path ambiguous.
fn dotted_key(path: &str, v: &Value) -> Option<String> {
    let Value::Object(map) = v else { return None };
    for (k, vv) in map.iter() {
        let p = format!("{}.{}", path, k);
        if k.is_empty() || k.contains('.') {
            return Some(p);
        }
        if let Some(bad) = dotted_key(&p, vv) {
            return Some(bad);
        }
    }
    None
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema for the built-in `Datasource` kind.
pub fn datasource_schema() -> KindSchema {
    KindSchema {
        group: DATASOURCE_GROUP.to_string(),
        version: DATASOURCE_VERSION.to_string(),
        kind: DATASOURCE_KIND.to_string(),
        fields: vec![
            FieldSpec::required("type", FieldType::String),
            FieldSpec::optional("access", FieldType::String),
            FieldSpec::optional("url", FieldType::String),
            FieldSpec::optional("user", FieldType::String),
            FieldSpec::optional("password", FieldType::String),
            FieldSpec::optional("basicAuth", FieldType::Bool),
            FieldSpec::optional("basicAuthUser", FieldType::String),
            FieldSpec::optional("basicAuthPassword", FieldType::String),
            FieldSpec::optional("withCredentials", FieldType::Bool),
            FieldSpec::optional("isDefault", FieldType::Bool),
            FieldSpec::optional("jsonData", FieldType::String),
            FieldSpec::optional("version", FieldType::Integer),
            FieldSpec::optional("readOnly", FieldType::Bool),
        ],
        flags: SchemaFlags::default(),
    }
}

type Gvk = (String, String, String);

/// Registered kinds. Objects of unregistered kinds are rejected.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    kinds: BTreeMap<Gvk, KindSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register(datasource_schema());
        r
    }

    /// Register or replace a kind schema.
    pub fn register(&mut self, schema: KindSchema) {
        let key = (schema.group.clone(), schema.version.clone(), schema.kind.clone());
        self.kinds.insert(key, schema);
    }

    pub fn get(&self, group: &str, version: &str, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(&(group.to_string(), version.to_string(), kind.to_string()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindSchema> { self.kinds.values() }

    pub fn validate(&self, obj: &ResourceObject) -> Result<(), ValidationError> {
        let id = &obj.identity;
        id.validate()?;
        let schema = self
            .get(&id.group, &id.version, &id.kind)
            .ok_or_else(|| ValidationError::Schema(format!("kind {} is not registered", id.gvk_key())))?;
        schema.validate(&obj.spec)
    }

    /// Distinct group/versions, sorted; these are the sweep targets.
    pub fn group_versions(&self) -> Vec<GroupVersion> {
        let mut out: Vec<GroupVersion> = self
            .kinds
            .keys()
            .map(|(g, v, _)| GroupVersion { group: g.clone(), version: v.clone() })
            .collect();
        out.dedup();
        out
    }
}
