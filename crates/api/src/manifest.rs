//! YAML manifests: `{apiVersion, kind, metadata, spec}` documents to and from
//! [`ResourceObject`], plus a minimal structural diff.

use anyhow::{anyhow, Context, Result};
use intent_core::{ResourceIdentity, ResourceObject, ResourceVersion, Spec};
use intent_schema::KindSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Size guards for untrusted manifest payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    /// Whole payload, all documents.
    pub bytes: usize,
    /// Values in one document, counting every mapping, sequence and scalar.
    pub nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self { Self { bytes: 1 << 20, nodes: 100_000 } }
}

impl ManifestLimits {
    /// `INTENT_MAX_YAML_BYTES` and `INTENT_MAX_YAML_NODES` over the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let read = |key: &str, fallback: usize| std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(fallback);
        Self { bytes: read("INTENT_MAX_YAML_BYTES", d.bytes), nodes: read("INTENT_MAX_YAML_NODES", d.nodes) }
    }

    /// True once `doc` holds more than `nodes` values. Stops counting there.
    fn too_deep(&self, doc: &Json) -> bool {
        let mut pending = vec![doc];
        let mut seen = 0usize;
        while let Some(v) = pending.pop() {
            seen += 1;
            if seen > self.nodes {
                return true;
            }
            match v {
                Json::Object(map) => pending.extend(map.values()),
                Json::Array(items) => pending.extend(items.iter()),
                _ => {}
            }
        }
        false
    }
}

/// One parsed manifest document.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub object: ResourceObject,
    /// `metadata.resourceVersion`, when the author pinned one.
    pub expected: Option<ResourceVersion>,
}

/// Parse every document in a (possibly multi-document) YAML payload.
/// `default_ns` applies to documents without `metadata.namespace`.
pub fn parse_manifests(yaml: &str, default_ns: &str) -> Result<Vec<Manifest>> {
    let limits = ManifestLimits::from_env();
    if yaml.len() > limits.bytes {
        return Err(anyhow!("manifest payload is {} bytes; the limit is {}", yaml.len(), limits.bytes));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if limits.too_deep(&json) {
            return Err(anyhow!("manifest document {} holds more than {} values", i + 1, limits.nodes));
        }
        out.push(from_json(&json, default_ns)?);
    }
    if out.is_empty() {
        return Err(anyhow!("YAML contains no documents"));
    }
    Ok(out)
}

/// Parse a single-document manifest.
pub fn parse_manifest(yaml: &str, default_ns: &str) -> Result<Manifest> {
    let mut docs = parse_manifests(yaml, default_ns)?;
    if docs.len() > 1 {
        return Err(anyhow!("expected one YAML document, found {}", docs.len()));
    }
    Ok(docs.remove(0))
}

fn from_json(json: &Json, default_ns: &str) -> Result<Manifest> {
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?;
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    let meta = json.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing metadata.name"))?;
    let ns = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or(default_ns);
    let expected = match meta.and_then(|m| m.get("resourceVersion")) {
        None | Some(Json::Null) => None,
        Some(Json::String(s)) => Some(s.parse::<ResourceVersion>()?),
        Some(Json::Number(n)) => Some(ResourceVersion(n.as_u64().ok_or_else(|| anyhow!("metadata.resourceVersion must be a non-negative integer"))?)),
        Some(_) => return Err(anyhow!("metadata.resourceVersion must be a string")),
    };
    let spec: Spec = match json.get("spec") {
        None | Some(Json::Null) => Spec::new(),
        Some(Json::Object(m)) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(_) => return Err(anyhow!("spec must be a mapping")),
    };
    let identity = ResourceIdentity::new(group, version, kind, ns, name)?;
    Ok(Manifest { object: ResourceObject::new(identity, spec), expected })
}

/// Render an object back into manifest form.
pub fn to_manifest(obj: &ResourceObject) -> Json {
    let id = &obj.identity;
    let mut meta = serde_json::Map::new();
    meta.insert("name".into(), Json::String(id.name.clone()));
    meta.insert("namespace".into(), Json::String(id.namespace.clone()));
    if !obj.resource_version.is_unset() {
        meta.insert("resourceVersion".into(), Json::String(obj.resource_version.to_string()));
    }
    if let Some(ts) = chrono::DateTime::from_timestamp_millis(obj.created_at).filter(|_| obj.created_at > 0) {
        meta.insert("creationTimestamp".into(), Json::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)));
    }
    serde_json::json!({
        "apiVersion": id.group_version().to_string(),
        "kind": id.kind,
        "metadata": meta,
        "spec": spec_value(&obj.spec),
    })
}

pub fn spec_value(spec: &Spec) -> Json {
    Json::Object(spec.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// A kind schema file: `{group, version, kind, openAPIV3Schema}` where the
/// schema describes `spec`.
pub fn parse_schema(yaml: &str) -> Result<KindSchema> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SchemaDoc {
        #[serde(default)]
        group: String,
        version: String,
        kind: String,
        #[serde(rename = "openAPIV3Schema")]
        open_api_v3_schema: Json,
    }
    let doc: SchemaDoc = serde_yaml::from_str(yaml).context("parsing schema YAML")?;
    Ok(KindSchema::from_openapi(&doc.group, &doc.version, &doc.kind, &doc.open_api_v3_schema)?)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            // scalars differ or type differs
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    const DS: &str = r#"
apiVersion: datasource.core.intent.dev/v1alpha1
kind: Datasource
metadata:
  name: prom
spec:
  type: prometheus
  url: http://prom:9090
  jsonData:
    httpMethod: POST
"#;

    #[test]
    fn parses_datasource_manifest() {
        let m = parse_manifest(DS, "default").unwrap();
        let id = &m.object.identity;
        assert_eq!(id.group, "datasource.core.intent.dev");
        assert_eq!(id.version, "v1alpha1");
        assert_eq!(id.kind, "Datasource");
        assert_eq!(id.namespace, "default");
        assert_eq!(id.name, "prom");
        assert_eq!(m.object.spec.get("url"), Some(&serde_json::json!("http://prom:9090")));
        assert!(m.expected.is_none());
    }

    #[test]
    fn core_group_and_pinned_version() {
        let y = "apiVersion: v1\nkind: Thing\nmetadata:\n  name: t\n  namespace: org-3\n  resourceVersion: \"17\"\n";
        let m = parse_manifest(y, "default").unwrap();
        assert_eq!(m.object.identity.group, "");
        assert_eq!(m.object.identity.namespace, "org-3");
        assert_eq!(m.expected, Some(ResourceVersion(17)));
        assert!(m.object.spec.is_empty());
    }

    #[test]
    fn multi_document_payloads() {
        let y = format!("{}\n---\n{}", DS, DS.replace("name: prom", "name: loki"));
        let docs = parse_manifests(&y, "default").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].object.identity.name, "loki");
        assert!(parse_manifest(&y, "default").is_err());
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = parse_manifest("kind: Foo\nmetadata:\n  name: x\n", "default").unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = parse_manifest("apiVersion: v1\nmetadata:\n  name: x\n", "default").unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = parse_manifest("apiVersion: v1\nkind: Thing\nmetadata: {}\n", "default").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
        let e4 = parse_manifest("apiVersion: v1\nkind: Thing\nmetadata:\n  name: x\nspec: [1]\n", "default").unwrap_err().to_string();
        assert!(e4.contains("spec must be a mapping"), "e4={}", e4);
    }

    #[test]
    fn value_limit_counts_every_node() {
        // root, a, 1..4, b, c
        let v = serde_json::json!({ "a": [1, 2, 3, 4], "b": { "c": 1 } });
        assert!(ManifestLimits { nodes: 7, ..Default::default() }.too_deep(&v));
        assert!(!ManifestLimits { nodes: 8, ..Default::default() }.too_deep(&v));
    }

    #[test]
    fn manifest_renders_back() {
        let mut m = parse_manifest(DS, "default").unwrap();
        m.object.resource_version = ResourceVersion(9);
        m.object.created_at = 1_700_000_000_000;
        let out = to_manifest(&m.object);
        assert_eq!(out["apiVersion"], "datasource.core.intent.dev/v1alpha1");
        assert_eq!(out["metadata"]["resourceVersion"], "9");
        assert_eq!(out["metadata"]["creationTimestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(out["spec"]["jsonData"]["httpMethod"], "POST");
    }

    #[test]
    fn schema_file_registers_a_kind() {
        let y = r#"
group: example.dev
version: v1
kind: Widget
openAPIV3Schema:
  type: object
  required: [size]
  properties:
    size: { type: integer }
    label: { type: string }
"#;
        let s = parse_schema(y).unwrap();
        assert_eq!(s.gvk_key(), "example.dev/v1/Widget");
        assert!(s.fields.iter().any(|f| f.name == "size" && f.required));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({
            "a": 2,                  // scalar update
            "b": { "x": 1, "y": 2 }, // nested add
            "c": [1, 9],             // element update + one removal
            "d": true                // key add
        });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&target, &target).is_empty());
    }
}
