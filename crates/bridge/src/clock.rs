//! Version allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use intent_core::ResourceVersion;

/// Hands out versions as `max(now_micros, last + 1, floor + 1)`.
///
/// Strictly increasing within the process and anchored to wall time, so a
/// recreated name never sees a version from before its deletion, even after
/// a restart.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self { Self::default() }

    pub fn next(&self, floor: ResourceVersion) -> ResourceVersion {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev.saturating_add(1)).max(floor.0.saturating_add(1));
            match self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return ResourceVersion(next),
                Err(p) => prev = p,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_and_above_floor() {
        let c = VersionClock::new();
        let a = c.next(ResourceVersion::UNSET);
        let b = c.next(ResourceVersion::UNSET);
        assert!(b > a);
        let far = ResourceVersion(u64::MAX / 2);
        let d = c.next(far);
        assert_eq!(d, ResourceVersion(far.0 + 1));
        assert!(c.next(ResourceVersion::UNSET) > d);
    }
}
