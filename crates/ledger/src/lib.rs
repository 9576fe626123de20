//! Intent ledger: the last-known-intent record for every identity.
//!
//! Each identity owns a [`Slot`] behind its own mutex; there is no lock shared
//! across identities on the processing path. Slot locks are short and never
//! held across an `.await`. Every status change bumps an epoch on a watch
//! channel so callers can wait for the next change instead of spinning.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use intent_core::ResourceIdentity;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

mod intent;
mod slot;

pub use intent::{Desired, Intent, IntentHandle, IntentKind, IntentStatus, Queued};
pub use slot::{Next, Slot};

pub type SlotRef = Arc<Mutex<Slot>>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown intent {0}")]
    UnknownIntent(IntentHandle),
    #[error("intent {0} is {1} and can no longer be cancelled")]
    NotCancellable(IntentHandle, IntentStatus),
}

/// Lock a slot, recovering from poisoning: slot state stays consistent
/// between statements, so a panicked holder leaves nothing half-written.
pub fn lock(slot: &SlotRef) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

/// Counts across all identities, for reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub epoch: u64,
    pub identities: usize,
    pub queued: usize,
    pub applying: usize,
    pub drivers: usize,
}

pub struct Ledger {
    slots: RwLock<FxHashMap<String, SlotRef>>,
    handles: RwLock<FxHashMap<IntentHandle, SlotRef>>,
    history_cap: usize,
    epoch_tx: watch::Sender<u64>,
}

impl Ledger {
    pub fn new(history_cap: usize) -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self {
            slots: RwLock::new(FxHashMap::default()),
            handles: RwLock::new(FxHashMap::default()),
            history_cap,
            epoch_tx,
        }
    }

    /// Slot for `id`, created on first use.
    pub fn slot(&self, id: &ResourceIdentity) -> SlotRef {
        let key = id.full_key();
        if let Some(s) = self.slots.read().unwrap_or_else(|p| p.into_inner()).get(&key) {
            return Arc::clone(s);
        }
        let mut w = self.slots.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            w.entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(Slot::new(id.clone(), self.history_cap)))),
        )
    }

    pub fn existing_slot(&self, id: &ResourceIdentity) -> Option<SlotRef> {
        self.slots.read().unwrap_or_else(|p| p.into_inner()).get(&id.full_key()).cloned()
    }

    /// Slots whose identity belongs to `group/version`.
    pub fn slots_in(&self, group: &str, version: &str) -> Vec<SlotRef> {
        let r = self.slots.read().unwrap_or_else(|p| p.into_inner());
        r.values()
            .filter(|s| {
                let g = lock(s);
                g.identity.group == group && g.identity.version == version
            })
            .cloned()
            .collect()
    }

    /// Make `h` resolvable through `status`/`cancel`.
    pub fn register(&self, h: IntentHandle, slot: &SlotRef) {
        self.handles.write().unwrap_or_else(|p| p.into_inner()).insert(h, Arc::clone(slot));
    }

    /// Drop handles whose status history was evicted.
    pub fn forget(&self, evicted: &[IntentHandle]) {
        if evicted.is_empty() {
            return;
        }
        let mut w = self.handles.write().unwrap_or_else(|p| p.into_inner());
        for h in evicted {
            w.remove(h);
        }
        debug!(count = evicted.len(), "evicted intent history");
    }

    fn slot_of(&self, h: &IntentHandle) -> Option<SlotRef> {
        self.handles.read().unwrap_or_else(|p| p.into_inner()).get(h).cloned()
    }

    pub fn status(&self, h: &IntentHandle) -> Result<IntentStatus, LedgerError> {
        let slot = self.slot_of(h).ok_or(LedgerError::UnknownIntent(*h))?;
        let s = lock(&slot).status(h);
        s.ok_or(LedgerError::UnknownIntent(*h))
    }

    pub fn cancel(&self, h: &IntentHandle) -> Result<(), LedgerError> {
        let slot = self.slot_of(h).ok_or(LedgerError::UnknownIntent(*h))?;
        let evicted = lock(&slot).cancel(*h)?;
        self.forget(&evicted);
        self.bump();
        Ok(())
    }

    /// Drop slots that went dormant before `cutoff`, with their status
    /// history. Versions stay monotonic across re-creation through the
    /// bridge's clock, so a dropped slot loses nothing the store lacks.
    /// A slot someone still holds outside the ledger is kept.
    pub fn prune(&self, cutoff: tokio::time::Instant) -> usize {
        let mut dropped = Vec::new();
        let mut pruned = 0;
        {
            let mut w = self.slots.write().unwrap_or_else(|p| p.into_inner());
            let handles = self.handles.read().unwrap_or_else(|p| p.into_inner());
            w.retain(|_, slot| {
                let s = lock(slot);
                if !s.is_dormant(cutoff) {
                    return true;
                }
                let own = s.handles();
                let registered = own.iter().filter(|h| handles.get(*h).map_or(false, |r| Arc::ptr_eq(r, slot))).count();
                if Arc::strong_count(slot) > 1 + registered {
                    return true;
                }
                dropped.extend(own);
                pruned += 1;
                false
            });
        }
        self.forget(&dropped);
        pruned
    }

    /// Announce that some status changed.
    pub fn bump(&self) {
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let r = self.slots.read().unwrap_or_else(|p| p.into_inner());
        let mut snap = LedgerSnapshot { epoch: *self.epoch_tx.borrow(), identities: r.len(), ..Default::default() };
        for s in r.values() {
            let g = lock(s);
            snap.queued += g.queued_len();
            snap.applying += usize::from(g.applying().is_some());
            snap.drivers += usize::from(g.driver);
        }
        snap
    }
}
