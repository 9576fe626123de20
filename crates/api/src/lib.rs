//! Declarative API front (in-process).
//!
//! This crate defines the call contract front ends (CLI, future transports)
//! depend on. Mutations return an [`IntentHandle`] as soon as the intent is
//! accepted; the store catches up asynchronously.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use intent_bridge::{Bridge, BridgeError, IntentRequest};
use intent_core::{ResourceIdentity, ResourceObject, ResourceVersion};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod manifest;

pub use intent_bridge::{IntentHandle, IntentStatus};
pub use manifest::{diff_summary, parse_manifest, parse_manifests, to_manifest, DiffSummary, Manifest, ManifestLimits};

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let msg = e.to_string();
        match e {
            BridgeError::Validation(_) => ApiError::Validation(msg),
            BridgeError::AlreadyExists(_) => ApiError::AlreadyExists(msg),
            BridgeError::Conflict { .. } | BridgeError::NotCancellable(..) => ApiError::Conflict(msg),
            BridgeError::NotFound(_) | BridgeError::UnknownIntent(_) => ApiError::NotFound(msg),
            BridgeError::ShuttingDown => ApiError::Unavailable(msg),
            BridgeError::Store(s) if s.is_transient() => ApiError::Unavailable(msg),
            BridgeError::Store(_) => ApiError::Internal(msg),
        }
    }
}

/// A registered kind and its declared spec fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
    /// Live spec already matches; nothing was submitted.
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub identity: ResourceIdentity,
    pub action: ApplyAction,
    pub handle: Option<IntentHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffReport {
    pub identity: ResourceIdentity,
    /// Live version, `None` when the object does not exist yet.
    pub live: Option<ResourceVersion>,
    pub summary: DiffSummary,
}

/// Declarative API surface.
#[async_trait::async_trait]
pub trait IntentApi: Send + Sync {
    async fn create(&self, obj: ResourceObject) -> ApiResult<IntentHandle>;

    /// `expected` is the version the caller last read.
    async fn update(&self, obj: ResourceObject, expected: ResourceVersion) -> ApiResult<IntentHandle>;

    async fn delete(&self, id: ResourceIdentity) -> ApiResult<IntentHandle>;

    async fn status(&self, h: &IntentHandle) -> ApiResult<IntentStatus>;

    /// Pending intents only.
    async fn cancel(&self, h: &IntentHandle) -> ApiResult<()>;

    /// Wait for a terminal status, returning the last observed one on timeout.
    async fn wait(&self, h: &IntentHandle, timeout: Duration) -> ApiResult<IntentStatus>;

    async fn get(&self, id: &ResourceIdentity) -> ApiResult<Option<ResourceObject>>;

    async fn list(&self, group: &str, version: &str, namespace: Option<&str>) -> ApiResult<Vec<ResourceObject>>;

    /// Create each manifest when absent, otherwise update it against the live
    /// version (or the version pinned in `metadata.resourceVersion`).
    async fn apply_manifest(&self, yaml: &str, default_ns: &str) -> ApiResult<Vec<ApplyOutcome>>;

    /// Diff each manifest's spec against the live object.
    async fn diff_manifest(&self, yaml: &str, default_ns: &str) -> ApiResult<Vec<DiffReport>>;

    async fn kinds(&self) -> ApiResult<Vec<KindInfo>>;
}

/// In-process implementation that calls the bridge directly.
pub struct InProcApi {
    bridge: Arc<Bridge>,
}

impl InProcApi {
    pub fn new(bridge: Arc<Bridge>) -> Self { Self { bridge } }

    pub fn bridge(&self) -> &Arc<Bridge> { &self.bridge }

    async fn submit(&self, op: &'static str, req: IntentRequest) -> ApiResult<IntentHandle> {
        let t0 = Instant::now();
        let id = req.identity().to_string();
        counter!("api_requests_total", 1u64, "op" => op);
        let res = self.bridge.submit(req).await.map_err(ApiError::from);
        match &res {
            Ok(h) => info!(op, id = %id, intent = %h, took_ms = %t0.elapsed().as_millis(), "api: accepted"),
            Err(e) => info!(op, id = %id, error = %e, "api: rejected"),
        }
        res
    }
}

fn manifest_err(e: anyhow::Error) -> ApiError { ApiError::Validation(format!("{:#}", e)) }

#[async_trait::async_trait]
impl IntentApi for InProcApi {
    async fn create(&self, obj: ResourceObject) -> ApiResult<IntentHandle> {
        self.submit("create", IntentRequest::Create(obj)).await
    }

    async fn update(&self, obj: ResourceObject, expected: ResourceVersion) -> ApiResult<IntentHandle> {
        self.submit("update", IntentRequest::Update { object: obj, expected }).await
    }

    async fn delete(&self, id: ResourceIdentity) -> ApiResult<IntentHandle> {
        self.submit("delete", IntentRequest::Delete(id)).await
    }

    async fn status(&self, h: &IntentHandle) -> ApiResult<IntentStatus> { Ok(self.bridge.status(h)?) }

    async fn cancel(&self, h: &IntentHandle) -> ApiResult<()> {
        self.bridge.cancel(h)?;
        info!(intent = %h, "api: cancelled");
        Ok(())
    }

    async fn wait(&self, h: &IntentHandle, timeout: Duration) -> ApiResult<IntentStatus> {
        Ok(self.bridge.wait(h, timeout).await?)
    }

    async fn get(&self, id: &ResourceIdentity) -> ApiResult<Option<ResourceObject>> {
        counter!("api_requests_total", 1u64, "op" => "get");
        Ok(self.bridge.read(id).await?)
    }

    async fn list(&self, group: &str, version: &str, namespace: Option<&str>) -> ApiResult<Vec<ResourceObject>> {
        let t0 = Instant::now();
        counter!("api_requests_total", 1u64, "op" => "list");
        let items = self.bridge.list(group, version, namespace).await?;
        info!(group, version, ns = %namespace.unwrap_or("(all)"), count = items.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(items)
    }

    async fn apply_manifest(&self, yaml: &str, default_ns: &str) -> ApiResult<Vec<ApplyOutcome>> {
        let docs = parse_manifests(yaml, default_ns).map_err(manifest_err)?;
        let mut out = Vec::with_capacity(docs.len());
        for Manifest { object, expected } in docs {
            let identity = object.identity.clone();
            let (action, handle) = match self.bridge.read(&identity).await? {
                None => (ApplyAction::Created, Some(self.create(object).await?)),
                Some(live) if live.same_spec(&object) && expected.map_or(true, |v| v == live.resource_version) => {
                    (ApplyAction::Unchanged, None)
                }
                Some(live) => {
                    let expected = expected.unwrap_or(live.resource_version);
                    (ApplyAction::Updated, Some(self.update(object, expected).await?))
                }
            };
            out.push(ApplyOutcome { identity, action, handle });
        }
        Ok(out)
    }

    async fn diff_manifest(&self, yaml: &str, default_ns: &str) -> ApiResult<Vec<DiffReport>> {
        let docs = parse_manifests(yaml, default_ns).map_err(manifest_err)?;
        let mut out = Vec::with_capacity(docs.len());
        for Manifest { object, .. } in docs {
            let live = self.bridge.read(&object.identity).await?;
            let base = live.as_ref().map(|l| manifest::spec_value(&l.spec)).unwrap_or_else(|| serde_json::json!({}));
            let summary = diff_summary(&manifest::spec_value(&object.spec), &base);
            out.push(DiffReport { identity: object.identity, live: live.map(|l| l.resource_version), summary });
        }
        Ok(out)
    }

    async fn kinds(&self) -> ApiResult<Vec<KindInfo>> {
        Ok(self
            .bridge
            .registry()
            .kinds()
            .map(|k| KindInfo {
                group: k.group.clone(),
                version: k.version.clone(),
                kind: k.kind.clone(),
                fields: k.fields.iter().map(|f| f.name.clone()).collect(),
            })
            .collect())
    }
}
