//! Intent payloads, handles and statuses.

use intent_core::{ResourceIdentity, ResourceObject, ResourceVersion};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle returned to the submitter of an intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IntentHandle(pub Uuid);

impl IntentHandle {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for IntentHandle {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Display for IntentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

impl std::str::FromStr for IntentHandle {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Uuid::parse_str(s).map(Self) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Create,
    Update,
    Delete,
    /// Produced by the convergence sweep, never by clients.
    Resync,
}

/// State an identity should converge to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Desired {
    Present(ResourceObject),
    Absent,
}

impl Desired {
    pub fn version(&self) -> Option<ResourceVersion> {
        match self {
            Desired::Present(o) => Some(o.resource_version),
            Desired::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool { matches!(self, Desired::Present(_)) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Intent {
    Create(ResourceObject),
    /// `verified` is false when the store could not be read at submit time;
    /// `expected` is then checked against the live record when applied.
    Update { object: ResourceObject, expected: ResourceVersion, verified: bool },
    Delete(ResourceIdentity),
    Resync(Desired),
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Intent::Create(_) => IntentKind::Create,
            Intent::Update { .. } => IntentKind::Update,
            Intent::Delete(_) => IntentKind::Delete,
            Intent::Resync(_) => IntentKind::Resync,
        }
    }

    /// The state this intent drives its identity to.
    pub fn effect(&self) -> Desired {
        match self {
            Intent::Create(o) | Intent::Update { object: o, .. } => Desired::Present(o.clone()),
            Intent::Delete(_) => Desired::Absent,
            Intent::Resync(d) => d.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntentStatus {
    Pending,
    Applying,
    Applied,
    Failed(String),
    Deleted,
    Conflict,
    AlreadyExists,
    /// An unverified update found nothing to update.
    NotFound,
    Cancelled,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IntentStatus::Pending | IntentStatus::Applying)
    }

    /// Terminal and the intent's effect reached the store.
    pub fn is_success(&self) -> bool {
        matches!(self, IntentStatus::Applied | IntentStatus::Deleted)
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentStatus::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// An intent waiting in, or taken from, an identity queue.
#[derive(Debug, Clone)]
pub struct Queued {
    pub handle: IntentHandle,
    pub intent: Intent,
    /// Store attempts made so far.
    pub attempts: u32,
    /// Set while backing off after a transient failure.
    pub not_before: Option<tokio::time::Instant>,
    /// For resyncs: the client intent whose effect is being re-driven.
    pub origin: Option<IntentHandle>,
    /// The identity's version floor when this intent was enqueued. Live
    /// records at or below it were written or seen by this ledger.
    pub known_floor: ResourceVersion,
}

impl Queued {
    pub fn new(handle: IntentHandle, intent: Intent) -> Self {
        Self { handle, intent, attempts: 0, not_before: None, origin: None, known_floor: ResourceVersion::UNSET }
    }
}
