//! Intent bridge: accepts declarative mutation intents and reconciles them
//! into the backing store.
//!
//! Consistency is eventual. A submitted intent is durably recorded in the
//! ledger first and becomes observable in the store once its driver applies
//! it; the convergence sweep re-drives anything that diverged. Readers polling
//! the store directly may briefly miss a freshly created object, and must see
//! a deleted one disappear within [`BridgeConfig::convergence_bound`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use intent_core::{now_millis, GroupVersion, OrgScope, ResourceIdentity, ResourceObject, ResourceVersion};
use intent_ledger::{lock, Desired, Intent, Ledger, LedgerSnapshot, Queued, SlotRef};
use intent_persist::{record_to_object, RecordStore};
use intent_schema::SchemaRegistry;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

mod clock;
mod config;
mod driver;
mod error;
mod sweep;

pub use clock::VersionClock;
pub use config::{BridgeConfig, RetryPolicy};
pub use error::BridgeError;
pub use intent_ledger::{IntentHandle, IntentKind, IntentStatus};
pub use sweep::SweepReport;

/// A mutation intent as submitted by the declarative front.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IntentRequest {
    Create(ResourceObject),
    /// `expected` must be the version the caller last observed.
    Update { object: ResourceObject, expected: ResourceVersion },
    Delete(ResourceIdentity),
}

impl IntentRequest {
    pub fn identity(&self) -> &ResourceIdentity {
        match self {
            IntentRequest::Create(o) | IntentRequest::Update { object: o, .. } => &o.identity,
            IntentRequest::Delete(id) => id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            IntentRequest::Create(_) => "create",
            IntentRequest::Update { .. } => "update",
            IntentRequest::Delete(_) => "delete",
        }
    }
}

pub struct Bridge {
    store: Arc<dyn RecordStore>,
    registry: SchemaRegistry,
    config: BridgeConfig,
    ledger: Ledger,
    clock: VersionClock,
    sweeps: ArcSwap<SweepReport>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Bridge {
    /// Open the bridge lifecycle over an already opened store and start the
    /// convergence sweep. Must be called inside a tokio runtime.
    pub fn start(store: Arc<dyn RecordStore>, registry: SchemaRegistry, config: BridgeConfig) -> Arc<Self> {
        let bridge = Arc::new(Self {
            store,
            registry,
            ledger: Ledger::new(config.status_history),
            config,
            clock: VersionClock::new(),
            sweeps: ArcSwap::from_pointee(SweepReport::default()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        bridge.tasks.spawn(sweep::run(Arc::clone(&bridge)));
        info!(
            sweep_ms = bridge.config.sweep_interval.as_millis() as u64,
            max_attempts = bridge.config.retry.max_attempts,
            targets = bridge.registry.group_versions().len(),
            "bridge started"
        );
        bridge
    }

    pub fn config(&self) -> &BridgeConfig { &self.config }

    pub fn registry(&self) -> &SchemaRegistry { &self.registry }

    pub fn convergence_bound(&self) -> Duration { self.config.convergence_bound() }

    /// Accept a mutation intent.
    ///
    /// Validation, `AlreadyExists` and `Conflict` are decided here, before any
    /// store write, against the last accepted intent for the identity.
    /// Everything else is reported through [`Bridge::status`]. An update for
    /// an identity the store could not be read for is accepted unverified and
    /// checked against the live record when applied.
    pub async fn submit(self: &Arc<Self>, req: IntentRequest) -> Result<IntentHandle, BridgeError> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::ShuttingDown);
        }
        self.validate(&req)?;
        let id = req.identity().clone();
        let label = req.label();
        let slot = self.ledger.slot(&id);
        self.seed(&slot).await?;

        let handle = IntentHandle::new();
        let (evicted, spawn) = {
            let mut s = lock(&slot);
            let intent = match req {
                IntentRequest::Create(mut obj) => {
                    if let Some(Desired::Present(_)) = s.desired() {
                        counter!("bridge_rejected_total", 1u64, "reason" => "already_exists");
                        return Err(BridgeError::AlreadyExists(id.to_string()));
                    }
                    let now = now_millis();
                    obj.resource_version = self.clock.next(s.floor);
                    obj.created_at = now;
                    obj.updated_at = now;
                    Intent::Create(obj)
                }
                IntentRequest::Update { mut object, expected } => match s.desired() {
                    Some(Desired::Present(cur)) if cur.resource_version == expected => {
                        object.resource_version = self.clock.next(s.floor);
                        object.created_at = cur.created_at;
                        object.updated_at = now_millis();
                        Intent::Update { object, expected, verified: true }
                    }
                    Some(Desired::Present(cur)) => {
                        counter!("bridge_rejected_total", 1u64, "reason" => "conflict");
                        return Err(BridgeError::Conflict { id: id.to_string(), expected, actual: cur.resource_version });
                    }
                    Some(Desired::Absent) => return Err(BridgeError::NotFound(id.to_string())),
                    None => {
                        object.resource_version = self.clock.next(s.floor);
                        object.updated_at = now_millis();
                        Intent::Update { object, expected, verified: false }
                    }
                },
                IntentRequest::Delete(id) => Intent::Delete(id),
            };
            let evicted = s.enqueue(Queued::new(handle, intent));
            let spawn = !s.driver;
            s.driver = true;
            (evicted, spawn)
        };
        self.ledger.register(handle, &slot);
        self.ledger.forget(&evicted);
        self.ledger.bump();
        counter!("bridge_intents_total", 1u64, "kind" => label);
        debug!(intent = %handle, id = %id, kind = label, "intent accepted");
        if spawn {
            self.spawn_driver(slot);
        }
        Ok(handle)
    }

    fn validate(&self, req: &IntentRequest) -> Result<(), BridgeError> {
        match req {
            IntentRequest::Create(o) | IntentRequest::Update { object: o, .. } => self.registry.validate(o)?,
            IntentRequest::Delete(id) => {
                id.validate()?;
                if self.registry.get(&id.group, &id.version, &id.kind).is_none() {
                    return Err(intent_core::ValidationError::Schema(format!("kind {} is not registered", id.gvk_key())).into());
                }
            }
        }
        // the store keys rows by org; a namespace without one can never be written
        OrgScope::from_namespace(&req.identity().namespace)?;
        Ok(())
    }

    /// First contact with an identity: learn what the store holds so create and
    /// update checks have something to compare against. A store that is down
    /// leaves the slot unseeded and the checks move to apply time.
    async fn seed(&self, slot: &SlotRef) -> Result<(), BridgeError> {
        let id = {
            let s = lock(slot);
            if s.desired().is_some() {
                return Ok(());
            }
            s.identity.clone()
        };
        match self.store.get(&id).await {
            Ok(rec) => {
                let found = match rec {
                    Some(r) => Desired::Present(record_to_object(&r)?),
                    None => Desired::Absent,
                };
                let mut s = lock(slot);
                if s.desired().is_none() {
                    s.settle(found);
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!(id = %id, error = %e, "could not seed identity; apply-time checks will decide");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn spawn_driver(self: &Arc<Self>, slot: SlotRef) {
        self.tasks.spawn(driver::run(Arc::clone(self), slot));
    }

    pub fn status(&self, h: &IntentHandle) -> Result<IntentStatus, BridgeError> {
        Ok(self.ledger.status(h)?)
    }

    /// Cancel a pending intent. Applying intents run to completion.
    pub fn cancel(&self, h: &IntentHandle) -> Result<(), BridgeError> {
        self.ledger.cancel(h)?;
        counter!("bridge_cancelled_total", 1u64);
        Ok(())
    }

    /// Wait until `h` reaches a terminal status or `timeout` elapses; returns
    /// the status observed last.
    pub async fn wait(&self, h: &IntentHandle, timeout: Duration) -> Result<IntentStatus, BridgeError> {
        let mut rx = self.ledger.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let s = self.status(h)?;
            if s.is_terminal() {
                return Ok(s);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return self.status(h),
            }
        }
    }

    /// Read through the store adapter.
    pub async fn read(&self, id: &ResourceIdentity) -> Result<Option<ResourceObject>, BridgeError> {
        match self.store.get(id).await? {
            Some(rec) => Ok(Some(record_to_object(&rec)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, group: &str, version: &str, namespace: Option<&str>) -> Result<Vec<ResourceObject>, BridgeError> {
        let recs = self.store.list(group, version, namespace).await?;
        recs.iter().map(|r| record_to_object(r).map_err(BridgeError::from)).collect()
    }

    /// Run one convergence sweep now, outside the periodic schedule.
    pub async fn sweep_now(self: &Arc<Self>) -> Arc<SweepReport> {
        sweep::sweep_once(self).await
    }

    pub fn last_sweep(&self) -> Arc<SweepReport> { self.sweeps.load_full() }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot { self.ledger.snapshot() }

    /// Sweep targets.
    pub fn group_versions(&self) -> Vec<GroupVersion> { self.registry.group_versions() }

    /// Resolves once shutdown has been requested.
    pub async fn stopped(&self) { self.shutdown.cancelled().await }

    /// Stop the sweep, let in-flight attempts finish, then close the store.
    /// Pending intents stay pending.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.store.close().await?;
        info!("bridge stopped");
        Ok(())
    }
}
