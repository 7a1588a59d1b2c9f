//! Time primitives for Concord
//!
//! Conflicts are ordered by a per-context logical timestamp:
//! - Wall-clock milliseconds when the host clock moves forward
//! - Never less than last issued + 1, so stamps are strictly increasing per origin
//! - Observes remote stamps, so a local write after a remote one orders after it

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Logical timestamp - used to order conflicting mutations (last-writer-wins)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    pub const ZERO: LogicalTime = LogicalTime(0);

    #[inline]
    pub fn new(value: u64) -> Self {
        LogicalTime(value)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch (0 if the host clock is before it)
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where a clock reads physical time from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockMode {
    /// Hybrid: wall-clock milliseconds, bumped to stay strictly increasing
    #[default]
    WallClock,
    /// Pure counter (deterministic; used by tests and simulations)
    Counter,
}

/// Per-context logical clock
/// INVARIANT: `tick()` results are strictly increasing
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: u64,
    mode: ClockMode,
}

impl LogicalClock {
    pub fn new(mode: ClockMode) -> Self {
        LogicalClock { last: 0, mode }
    }

    /// Counter clock starting at zero
    pub fn counter() -> Self {
        Self::new(ClockMode::Counter)
    }

    /// Issue the next timestamp
    pub fn tick(&mut self) -> LogicalTime {
        let physical = match self.mode {
            ClockMode::WallClock => now_millis(),
            ClockMode::Counter => 0,
        };
        self.last = physical.max(self.last + 1);
        LogicalTime(self.last)
    }

    /// Fold in a timestamp seen from another context
    /// Only moves forward
    pub fn observe(&mut self, seen: LogicalTime) {
        if seen.0 > self.last {
            self.last = seen.0;
        }
    }

    /// Last issued or observed timestamp
    pub fn last(&self) -> LogicalTime {
        LogicalTime(self.last)
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }
}
