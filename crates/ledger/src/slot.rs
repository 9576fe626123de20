//! Per-identity slot: FIFO queue, in-flight intent and bounded status history.

use std::collections::VecDeque;
use std::sync::Arc;

use intent_core::{ResourceIdentity, ResourceVersion};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{Desired, Intent, IntentHandle, IntentStatus, LedgerError, Queued};

/// Statuses keyed by handle. Terminal entries are evicted oldest-first once
/// more than `cap` of them are retained; live ones are never evicted.
#[derive(Debug)]
pub(crate) struct StatusHistory {
    map: FxHashMap<IntentHandle, IntentStatus>,
    terminal: VecDeque<IntentHandle>,
    cap: usize,
}

impl StatusHistory {
    fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), terminal: VecDeque::new(), cap: cap.max(1) }
    }

    fn get(&self, h: &IntentHandle) -> Option<&IntentStatus> { self.map.get(h) }

    /// Returns handles evicted to make room.
    fn set(&mut self, h: IntentHandle, s: IntentStatus) -> Vec<IntentHandle> {
        let terminal = s.is_terminal();
        let was_terminal = self.map.insert(h, s).map(|p| p.is_terminal()).unwrap_or(false);
        let mut evicted = Vec::new();
        if terminal && !was_terminal {
            self.terminal.push_back(h);
            while self.terminal.len() > self.cap {
                if let Some(old) = self.terminal.pop_front() {
                    self.map.remove(&old);
                    evicted.push(old);
                }
            }
        }
        evicted
    }
}

/// What a driver should do next for an identity.
#[derive(Debug)]
pub enum Next {
    /// Queue is empty; the driver flag has been cleared.
    Idle,
    /// Head is backing off until the given instant.
    Wait(Instant),
    /// Head moved to `Applying`.
    Run(Queued),
}

#[derive(Debug)]
pub struct Slot {
    pub identity: ResourceIdentity,
    /// Effect of the last concluded intent, or what the store was last seen holding.
    settled: Option<Desired>,
    /// Highest version allocated or observed for this identity; survives deletion.
    pub floor: ResourceVersion,
    queue: VecDeque<Queued>,
    applying: Option<Queued>,
    /// A driver task currently owns this identity.
    pub driver: bool,
    /// Last client intent accepted for this identity.
    pub last_accepted: Option<IntentHandle>,
    history: StatusHistory,
    /// Wakes this identity's driver when its backing-off head is cancelled.
    wake: Arc<Notify>,
    /// Last enqueue, conclusion or settlement.
    touched: Instant,
}

impl Slot {
    pub fn new(identity: ResourceIdentity, history_cap: usize) -> Self {
        Self {
            identity,
            settled: None,
            floor: ResourceVersion::UNSET,
            queue: VecDeque::new(),
            applying: None,
            driver: false,
            last_accepted: None,
            history: StatusHistory::with_capacity(history_cap),
            wake: Arc::new(Notify::new()),
            touched: Instant::now(),
        }
    }

    pub fn waker(&self) -> Arc<Notify> { Arc::clone(&self.wake) }

    /// Handles this slot still holds a status for.
    pub fn handles(&self) -> Vec<IntentHandle> { self.history.map.keys().copied().collect() }

    /// Nothing queued, no driver, settled absent and untouched since `cutoff`.
    /// Such a slot carries no state the store or the version clock lacks.
    pub fn is_dormant(&self, cutoff: Instant) -> bool {
        self.is_idle() && !self.driver && self.settled == Some(Desired::Absent) && self.touched <= cutoff
    }

    /// State the identity converges to once the queue drains. `None` when the
    /// ledger has never seen this identity settle.
    pub fn desired(&self) -> Option<Desired> {
        self.queue
            .back()
            .map(|q| q.intent.effect())
            .or_else(|| self.applying.as_ref().map(|q| q.intent.effect()))
            .or_else(|| self.settled.clone())
    }

    pub fn settle(&mut self, d: Desired) {
        if let Some(v) = d.version() {
            self.raise_floor(v);
        }
        self.settled = Some(d);
        self.touched = Instant::now();
    }

    pub fn raise_floor(&mut self, v: ResourceVersion) {
        if v > self.floor {
            self.floor = v;
        }
    }

    pub fn is_idle(&self) -> bool { self.queue.is_empty() && self.applying.is_none() }

    pub fn queued_len(&self) -> usize { self.queue.len() }

    pub fn applying(&self) -> Option<&Queued> { self.applying.as_ref() }

    pub fn status(&self, h: &IntentHandle) -> Option<IntentStatus> { self.history.get(h).cloned() }

    /// Record a status; returns handles whose history was evicted.
    pub fn set_status(&mut self, h: IntentHandle, s: IntentStatus) -> Vec<IntentHandle> {
        self.history.set(h, s)
    }

    /// Append in arrival order as `Pending`.
    pub fn enqueue(&mut self, mut q: Queued) -> Vec<IntentHandle> {
        let h = q.handle;
        q.known_floor = self.floor;
        self.touched = Instant::now();
        if !matches!(q.intent, Intent::Resync(_)) {
            self.last_accepted = Some(h);
        }
        if let Some(v) = q.intent.effect().version() {
            self.raise_floor(v);
        }
        self.queue.push_back(q);
        self.set_status(h, IntentStatus::Pending)
    }

    /// Pop the head into `Applying` unless it is still backing off.
    pub fn next(&mut self, now: Instant) -> Next {
        debug_assert!(self.applying.is_none(), "one intent in flight per identity");
        let Some(head) = self.queue.front() else {
            self.driver = false;
            return Next::Idle;
        };
        if let Some(at) = head.not_before {
            if at > now {
                return Next::Wait(at);
            }
        }
        let Some(mut q) = self.queue.pop_front() else {
            self.driver = false;
            return Next::Idle;
        };
        q.not_before = None;
        self.set_status(q.handle, IntentStatus::Applying);
        self.applying = Some(q.clone());
        Next::Run(q)
    }

    /// Put the in-flight intent back at the head as `Pending` after a
    /// transient failure. It stays cancellable while it waits.
    pub fn retry_later(&mut self, mut q: Queued, at: Instant) -> Vec<IntentHandle> {
        self.applying = None;
        q.not_before = Some(at);
        let h = q.handle;
        self.queue.push_front(q);
        self.set_status(h, IntentStatus::Pending)
    }

    /// Finish the in-flight intent with a terminal status.
    pub fn conclude(&mut self, h: IntentHandle, status: IntentStatus, settled: Option<Desired>) -> Vec<IntentHandle> {
        debug_assert!(status.is_terminal());
        if self.applying.as_ref().map(|q| q.handle) == Some(h) {
            self.applying = None;
        }
        if let Some(d) = settled {
            self.settle(d);
        }
        self.touched = Instant::now();
        self.set_status(h, status)
    }

    /// Remove a pending intent. An applying one runs to completion.
    pub fn cancel(&mut self, h: IntentHandle) -> Result<Vec<IntentHandle>, LedgerError> {
        if self.applying.as_ref().map(|q| q.handle) == Some(h) {
            return Err(LedgerError::NotCancellable(h, IntentStatus::Applying));
        }
        match self.queue.iter().position(|q| q.handle == h) {
            Some(idx) => {
                self.queue.remove(idx);
                if idx == 0 {
                    self.wake.notify_one();
                }
                if self.last_accepted == Some(h) {
                    self.last_accepted = self
                        .queue
                        .iter()
                        .rev()
                        .find(|q| !matches!(q.intent, Intent::Resync(_)))
                        .map(|q| q.handle);
                }
                Ok(self.set_status(h, IntentStatus::Cancelled))
            }
            None => match self.status(&h) {
                Some(s) => Err(LedgerError::NotCancellable(h, s)),
                None => Err(LedgerError::UnknownIntent(h)),
            },
        }
    }
}
