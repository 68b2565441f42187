//! Replication parameters accumulated along graph paths.

use serde::{Deserialize, Serialize};

use crate::schedule::Schedule;

/// Cost value meaning "unreachable".
pub const MAX_COST: u32 = u32::MAX;

/// Cost, interval, option bits, and availability schedule carried by a
/// site link and accumulated along multi-link paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplInfo {
    /// Administrative cost of traversing the link or path.
    pub cost: u32,
    /// Replication interval in minutes.
    pub interval_min: u32,
    /// Option bits; see [`crate::objects::options`].
    pub options: u32,
    /// When replication across the link or path is allowed.
    pub schedule: Schedule,
}

impl ReplInfo {
    /// Builds a link's replication parameters.
    pub fn new(cost: u32, interval_min: u32, options: u32, schedule: Schedule) -> Self {
        ReplInfo {
            cost,
            interval_min,
            options,
            schedule,
        }
    }

    /// The identity element for path accumulation: zero cost, zero
    /// interval, all option bits set, always available. Merging the
    /// identity with any value yields that value.
    pub fn identity() -> Self {
        ReplInfo {
            cost: 0,
            interval_min: 0,
            options: !0,
            schedule: Schedule::always(),
        }
    }

    /// The worst element: maximal cost with an empty schedule. Used to
    /// reset vertices before a shortest-path pass.
    pub fn unreachable() -> Self {
        ReplInfo {
            cost: MAX_COST,
            interval_min: 0,
            options: !0,
            schedule: Schedule::never(),
        }
    }

    /// Accumulates another hop into a path: costs add with saturation,
    /// the interval is the slower of the two, options intersect, and
    /// schedules intersect.
    pub fn merge(&self, other: &ReplInfo) -> ReplInfo {
        ReplInfo {
            cost: self.cost.saturating_add(other.cost),
            interval_min: self.interval_min.max(other.interval_min),
            options: self.options & other.options,
            schedule: self.schedule.overlap(&other.schedule),
        }
    }

    /// True if the accumulated schedule still has an open slot. Paths
    /// whose schedules never overlap cannot carry replication.
    pub fn feasible(&self) -> bool {
        !self.schedule.is_never()
    }
}
