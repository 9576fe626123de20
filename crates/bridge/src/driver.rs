//! Per-identity driver: applies queued intents one at a time, in arrival order.

use std::sync::Arc;

use intent_core::ResourceIdentity;
use intent_ledger::{lock, Desired, Intent, IntentStatus, Next, Queued, SlotRef};
use intent_persist::{record_to_object, StoreError};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Bridge;

/// Drain the identity's queue. At most one driver runs per identity; the
/// slot's `driver` flag is cleared by `Slot::next` when the queue is empty.
pub(crate) async fn run(bridge: Arc<Bridge>, slot: SlotRef) {
    let (id, wake) = {
        let s = lock(&slot);
        (s.identity.clone(), s.waker())
    };
    loop {
        if bridge.shutdown.is_cancelled() {
            lock(&slot).driver = false;
            break;
        }
        let next = lock(&slot).next(Instant::now());
        match next {
            Next::Idle => break,
            Next::Wait(at) => {
                tokio::select! {
                    _ = bridge.shutdown.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {}
                    _ = wake.notified() => {}
                }
            }
            Next::Run(q) => {
                bridge.ledger.bump();
                let started = std::time::Instant::now();
                let res = apply(&bridge, &id, &q).await;
                histogram!("bridge_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
                record(&bridge, &slot, q, res);
            }
        }
    }
}

/// One store attempt for an intent. Returns the intent's terminal status and
/// the state the identity settled in.
async fn apply(bridge: &Bridge, id: &ResourceIdentity, q: &Queued) -> Result<(IntentStatus, Desired), StoreError> {
    let store = &bridge.store;
    match &q.intent {
        Intent::Create(obj) => match store.get(&obj.identity).await? {
            Some(rec) if rec.resource_version == obj.resource_version => {
                Ok((IntentStatus::Applied, Desired::Present(obj.clone())))
            }
            // left behind by an earlier intent here whose delete never landed
            Some(rec) if !q.known_floor.is_unset() && rec.resource_version <= q.known_floor => {
                debug!(id = %obj.identity, stale = %rec.resource_version, "create replaces a stale record");
                store.put(obj).await?;
                Ok((IntentStatus::Applied, Desired::Present(obj.clone())))
            }
            Some(rec) => {
                info!(id = %obj.identity, live = %rec.resource_version, "create found a live record; not overwriting");
                Ok((IntentStatus::AlreadyExists, Desired::Present(record_to_object(&rec)?)))
            }
            None => {
                store.put(obj).await?;
                Ok((IntentStatus::Applied, Desired::Present(obj.clone())))
            }
        },
        Intent::Update { object, expected, verified: false } => match store.get(&object.identity).await? {
            None => Ok((IntentStatus::NotFound, Desired::Absent)),
            Some(rec) if rec.resource_version != *expected => {
                info!(id = %object.identity, live = %rec.resource_version, expected = %expected, "update expected another version");
                Ok((IntentStatus::Conflict, Desired::Present(record_to_object(&rec)?)))
            }
            Some(rec) => {
                let mut object = object.clone();
                object.created_at = rec.created_at;
                store.put(&object).await?;
                Ok((IntentStatus::Applied, Desired::Present(object)))
            }
        },
        Intent::Update { object, .. } => match store.get(&object.identity).await? {
            Some(rec) if rec.resource_version > object.resource_version => {
                info!(id = %object.identity, live = %rec.resource_version, ours = %object.resource_version, "store holds a newer version");
                Ok((IntentStatus::Conflict, Desired::Present(record_to_object(&rec)?)))
            }
            _ => {
                store.put(object).await?;
                Ok((IntentStatus::Applied, Desired::Present(object.clone())))
            }
        },
        Intent::Delete(_) => {
            let out = store.delete(id).await?;
            debug!(id = %id, outcome = ?out, "delete applied");
            Ok((IntentStatus::Deleted, Desired::Absent))
        }
        Intent::Resync(Desired::Present(obj)) => {
            store.put(obj).await?;
            Ok((IntentStatus::Applied, Desired::Present(obj.clone())))
        }
        Intent::Resync(Desired::Absent) => {
            store.delete(id).await?;
            Ok((IntentStatus::Deleted, Desired::Absent))
        }
    }
}

fn record(bridge: &Bridge, slot: &SlotRef, mut q: Queued, res: Result<(IntentStatus, Desired), StoreError>) {
    q.attempts += 1;
    let h = q.handle;
    let max = bridge.config.retry.max_attempts;
    let mut s = lock(slot);
    let evicted = match res {
        Ok((status, settled)) => {
            counter!("bridge_applied_total", 1u64);
            debug!(intent = %h, id = %s.identity, status = %status, attempts = q.attempts, "intent concluded");
            let mut ev = s.conclude(h, status.clone(), Some(settled));
            if let Some(origin) = q.origin {
                if status.is_success() && matches!(s.status(&origin), Some(IntentStatus::Failed(_))) {
                    info!(intent = %origin, id = %s.identity, "sweep converged a failed intent");
                    ev.extend(s.set_status(origin, status));
                }
            }
            ev
        }
        Err(e) if e.is_transient() && q.attempts < max => {
            let delay = bridge.config.retry.delay(q.attempts);
            counter!("bridge_retries_total", 1u64);
            warn!(intent = %h, id = %s.identity, attempt = q.attempts, delay_ms = delay.as_millis() as u64, error = %e, "store unavailable; Failed -> Pending");
            s.retry_later(q, Instant::now() + delay)
        }
        Err(e) if e.is_transient() => {
            let reason = format!("retry exhausted after {} attempts: {}", q.attempts, e);
            counter!("bridge_failed_total", 1u64, "cause" => "exhausted");
            warn!(intent = %h, id = %s.identity, reason = %reason, "intent failed; sweep will keep converging");
            // Still accepted: the sweep drives the store toward it.
            let effect = q.intent.effect();
            s.conclude(h, IntentStatus::Failed(reason), Some(effect))
        }
        Err(e) => {
            counter!("bridge_failed_total", 1u64, "cause" => "rejected");
            warn!(intent = %h, id = %s.identity, error = %e, "store rejected intent");
            s.conclude(h, IntentStatus::Failed(e.to_string()), None)
        }
    };
    drop(s);
    bridge.ledger.forget(&evicted);
    bridge.ledger.bump();
}

#[cfg(test)]
mod tests {
    use super::*;
    use intent_core::{ResourceObject, Spec};
    use intent_ledger::IntentHandle;
    use intent_persist::MemoryStore;
    use intent_schema::SchemaRegistry;

    use crate::BridgeConfig;

    #[tokio::test]
    async fn rejected_intent_leaves_desired_state_alone() {
        let b = Bridge::start(Arc::new(MemoryStore::new()), SchemaRegistry::with_builtins(), BridgeConfig::default());
        let id = ResourceIdentity::new("", "v1", "Thing", "default", "a").unwrap();
        let slot = b.ledger.slot(&id);
        lock(&slot).settle(Desired::Absent);
        let h = IntentHandle::new();
        lock(&slot).enqueue(Queued::new(h, Intent::Create(ResourceObject::new(id.clone(), Spec::new()))));
        b.ledger.register(h, &slot);
        let Next::Run(q) = lock(&slot).next(Instant::now()) else { panic!("expected run") };

        record(&b, &slot, q, Err(StoreError::Corrupt("bad row".into())));
        assert!(matches!(b.status(&h).unwrap(), IntentStatus::Failed(_)));
        assert_eq!(lock(&slot).desired(), Some(Desired::Absent));
        b.shutdown().await.unwrap();
    }
}
