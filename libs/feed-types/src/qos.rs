//! Quality of service
//!
//! A QoS is a (timeliness, rate) pair. "Better" means fresher data first,
//! then faster rate. Range matching treats each dimension independently.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Data timeliness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "millis")]
pub enum Timeliness {
    Realtime,
    /// Delayed by an unknown amount
    DelayedUnknown,
    /// Delayed by the given number of milliseconds
    Delayed(u16),
}

impl Timeliness {
    fn rank(&self) -> (u8, u16) {
        match self {
            Timeliness::Realtime => (0, 0),
            Timeliness::Delayed(ms) => (1, *ms),
            Timeliness::DelayedUnknown => (2, 0),
        }
    }
}

/// Data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "millis")]
pub enum Rate {
    TickByTick,
    /// Just-in-time conflation
    JitConflated,
    /// Conflated at the given interval in milliseconds
    Conflated(u16),
}

impl Rate {
    fn rank(&self) -> (u8, u16) {
        match self {
            Rate::TickByTick => (0, 0),
            Rate::Conflated(ms) => (1, *ms),
            Rate::JitConflated => (2, 0),
        }
    }
}

/// Quality of service of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qos {
    pub timeliness: Timeliness,
    pub rate: Rate,
    pub dynamic: bool,
}

impl Default for Qos {
    /// Realtime, tick-by-tick.
    fn default() -> Self {
        Self::realtime()
    }
}

impl Qos {
    pub fn new(timeliness: Timeliness, rate: Rate) -> Self {
        Self {
            timeliness,
            rate,
            dynamic: false,
        }
    }

    /// Realtime, tick-by-tick
    pub fn realtime() -> Self {
        Self::new(Timeliness::Realtime, Rate::TickByTick)
    }

    /// Compare timeliness then rate. `Less` means `self` is better.
    pub fn compare(&self, other: &Qos) -> Ordering {
        self.timeliness
            .rank()
            .cmp(&other.timeliness.rank())
            .then(self.rate.rank().cmp(&other.rate.rank()))
    }

    /// Returns true if `self` is strictly better than `other`.
    pub fn is_better(&self, other: &Qos) -> bool {
        self.compare(other) == Ordering::Less
    }

    /// Equal timeliness and rate. The dynamic flag is not part of identity.
    pub fn same_as(&self, other: &Qos) -> bool {
        self.timeliness == other.timeliness && self.rate == other.rate
    }

    /// Whether `self` lies inside `[best, worst]` in both dimensions.
    pub fn is_in_range(&self, best: &Qos, worst: &Qos) -> bool {
        let t = self.timeliness.rank();
        let r = self.rate.rank();
        t >= best.timeliness.rank()
            && t <= worst.timeliness.rank()
            && r >= best.rate.rank()
            && r <= worst.rate.rank()
    }

    /// Pick the QoS a request should be opened with from what a service offers.
    ///
    /// - no requested QoS: the best offered QoS
    /// - requested QoS only: an offered QoS equal to it
    /// - requested and worst QoS: the best offered QoS inside the range
    ///
    /// An empty offer list is treated as offering realtime tick-by-tick.
    pub fn best_match(requested: Option<&Qos>, worst: Option<&Qos>, offered: &[Qos]) -> Option<Qos> {
        let default_offer = [Qos::realtime()];
        let offered = if offered.is_empty() {
            &default_offer[..]
        } else {
            offered
        };

        match (requested, worst) {
            (None, _) => offered.iter().copied().min_by(|a, b| a.compare(b)),
            (Some(qos), None) => offered.iter().copied().find(|o| o.same_as(qos)),
            (Some(best), Some(worst)) => offered
                .iter()
                .copied()
                .filter(|o| o.is_in_range(best, worst))
                .min_by(|a, b| a.compare(b)),
        }
    }
}
