//! Convergence sweep: compare what the store holds against the ledger and
//! queue corrective intents for idle identities.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use intent_core::{GroupVersion, ResourceObject, StoreRecord};
use intent_ledger::{lock, Desired, Intent, IntentHandle, Queued, Slot, SlotRef};
use intent_persist::record_to_object;
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::Bridge;

/// Outcome of one sweep, published for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    /// Sweeps completed since start.
    pub epoch: u64,
    pub targets: usize,
    pub scanned: usize,
    pub resynced: usize,
    pub adopted: usize,
    /// Identities skipped because an intent was queued or applying.
    pub deferred: usize,
    /// Dormant deleted identities dropped from the ledger.
    pub pruned: usize,
    pub errors: usize,
    pub took_ms: u64,
}

pub(crate) async fn run(bridge: Arc<Bridge>) {
    let mut ticker = tokio::time::interval(bridge.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = bridge.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                sweep_once(&bridge).await;
            }
        }
    }
    debug!("sweep loop stopped");
}

pub(crate) async fn sweep_once(bridge: &Arc<Bridge>) -> Arc<SweepReport> {
    let started = Instant::now();
    let targets = bridge.registry.group_versions();
    let listed = join_all(targets.iter().map(|gv| async move {
        (gv, bridge.store.list(&gv.group, &gv.version, None).await)
    }))
    .await;

    let mut report = SweepReport { epoch: bridge.sweeps.load().epoch + 1, targets: targets.len(), ..Default::default() };
    for (gv, res) in listed {
        match res {
            Ok(recs) => reconcile(bridge, gv, recs, &mut report),
            Err(e) => {
                report.errors += 1;
                warn!(target_gv = %gv, error = %e, "sweep could not list store");
            }
        }
    }
    if let Some(cutoff) = tokio::time::Instant::now().checked_sub(bridge.config.slot_retention) {
        report.pruned = bridge.ledger.prune(cutoff);
    }
    report.took_ms = started.elapsed().as_millis() as u64;
    histogram!("bridge_sweep_ms", started.elapsed().as_secs_f64() * 1000.0);
    if report.resynced > 0 || report.adopted > 0 || report.pruned > 0 || report.errors > 0 {
        info!(
            epoch = report.epoch,
            scanned = report.scanned,
            resynced = report.resynced,
            adopted = report.adopted,
            deferred = report.deferred,
            pruned = report.pruned,
            errors = report.errors,
            "sweep"
        );
    }
    let report = Arc::new(report);
    bridge.sweeps.store(Arc::clone(&report));
    report
}

fn reconcile(bridge: &Arc<Bridge>, gv: &GroupVersion, recs: Vec<StoreRecord>, report: &mut SweepReport) {
    let mut seen = FxHashSet::default();
    for rec in recs {
        let live = match record_to_object(&rec) {
            Ok(o) => o,
            Err(e) => {
                report.errors += 1;
                warn!(key = rec.surrogate_key, error = %e, "undecodable store record");
                continue;
            }
        };
        report.scanned += 1;
        seen.insert(live.identity.full_key());
        let slot = bridge.ledger.slot(&live.identity);
        let mut s = lock(&slot);
        if !s.is_idle() {
            report.deferred += 1;
            continue;
        }
        let fix = match s.desired() {
            None => {
                adopt(&mut s, live, report);
                None
            }
            Some(Desired::Absent) if rec.resource_version > s.floor => {
                adopt(&mut s, live, report);
                None
            }
            Some(Desired::Absent) => Some(Desired::Absent),
            Some(Desired::Present(want)) if rec.resource_version < want.resource_version => Some(Desired::Present(want)),
            Some(Desired::Present(want)) if rec.resource_version > want.resource_version => {
                adopt(&mut s, live, report);
                None
            }
            Some(Desired::Present(_)) => None,
        };
        if let Some(d) = fix {
            resync(bridge, &slot, s, d, report);
        }
    }

    // Identities the ledger wants present that the store lost.
    for slot in bridge.ledger.slots_in(&gv.group, &gv.version) {
        let s = lock(&slot);
        if seen.contains(&s.identity.full_key()) {
            continue;
        }
        if !s.is_idle() {
            report.deferred += 1;
            continue;
        }
        if let Some(d @ Desired::Present(_)) = s.desired() {
            resync(bridge, &slot, s, d, report);
        }
    }
}

fn adopt(s: &mut Slot, live: ResourceObject, report: &mut SweepReport) {
    debug!(id = %s.identity, rv = %live.resource_version, "adopting store record");
    s.settle(Desired::Present(live));
    report.adopted += 1;
    counter!("bridge_adopted_total", 1u64);
}

fn resync(
    bridge: &Arc<Bridge>,
    slot: &SlotRef,
    mut s: std::sync::MutexGuard<'_, Slot>,
    d: Desired,
    report: &mut SweepReport,
) {
    let handle = IntentHandle::new();
    let mut q = Queued::new(handle, Intent::Resync(d));
    q.origin = s.last_accepted;
    let evicted = s.enqueue(q);
    let spawn = !s.driver;
    s.driver = true;
    debug!(intent = %handle, id = %s.identity, "queued resync");
    drop(s);
    bridge.ledger.register(handle, slot);
    bridge.ledger.forget(&evicted);
    bridge.ledger.bump();
    report.resynced += 1;
    counter!("bridge_resyncs_total", 1u64);
    if spawn {
        bridge.spawn_driver(Arc::clone(slot));
    }
}
