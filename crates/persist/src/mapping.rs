//! ResourceObject <-> StoreRecord mapping.

use std::collections::BTreeMap;

use intent_core::{OrgScope, ResourceObject, Spec, StoreRecord};
use serde_json::{Map, Value};

use crate::StoreError;

/// Flatten nested spec objects into `a.b.c` columns. Empty objects are kept as
/// a leaf so they survive the round trip.
pub fn flatten_spec(spec: &Spec) -> BTreeMap<String, Value> {
    fn walk(prefix: &str, v: &Value, out: &mut BTreeMap<String, Value>) {
        match v {
            Value::Object(map) if !map.is_empty() => {
                for (k, vv) in map.iter() {
                    walk(&format!("{}.{}", prefix, k), vv, out);
                }
            }
            _ => { out.insert(prefix.to_string(), v.clone()); }
        }
    }
    let mut out = BTreeMap::new();
    for (k, v) in spec.iter() {
        walk(k, v, &mut out);
    }
    out
}

pub fn unflatten_fields(fields: &BTreeMap<String, Value>) -> Result<Spec, StoreError> {
    let mut root = Map::new();
    for (path, v) in fields.iter() {
        let mut segs: Vec<&str> = path.split('.').collect();
        let Some(leaf) = segs.pop() else { continue };
        let mut cur = &mut root;
        for seg in segs {
            let slot = cur.entry(seg.to_string()).or_insert_with(|| Value::Object(Map::new()));
            cur = match slot {
                Value::Object(m) => m,
                _ => return Err(StoreError::Corrupt(format!("field {} collides with a scalar at {}", path, seg))),
            };
        }
        if cur.insert(leaf.to_string(), v.clone()).is_some() {
            return Err(StoreError::Corrupt(format!("duplicate field {}", path)));
        }
    }
    Ok(root.into_iter().collect())
}

pub fn record_to_object(rec: &StoreRecord) -> Result<ResourceObject, StoreError> {
    Ok(ResourceObject {
        identity: rec.identity.clone(),
        spec: unflatten_fields(&rec.fields)?,
        resource_version: rec.resource_version,
        created_at: rec.created_at,
        updated_at: rec.updated_at,
    })
}

/// Build the row for `obj`. The surrogate key comes from the store.
pub fn object_to_record(obj: &ResourceObject, surrogate_key: i64) -> Result<StoreRecord, StoreError> {
    let org_scope = OrgScope::from_namespace(&obj.identity.namespace)?;
    let now = intent_core::now_millis();
    Ok(StoreRecord {
        surrogate_key,
        org_scope,
        identity: obj.identity.clone(),
        resource_version: obj.resource_version,
        fields: flatten_spec(&obj.spec),
        created_at: if obj.created_at == 0 { now } else { obj.created_at },
        updated_at: if obj.updated_at == 0 { now } else { obj.updated_at },
    })
}
