//! Aggregate pool status snapshot.

use std::fmt;

/// Immutable snapshot of a pool's task counters.
///
/// `pending + running + succeeded + failed` stays constant once every task
/// has been added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Tasks waiting to be dispatched.
    pub pending: usize,
    /// Tasks whose process is alive.
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl PoolStatus {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed
    }

    /// No task is pending or running.
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.running == 0
    }

    /// Finished without a single failure.
    pub fn is_successful(&self) -> bool {
        self.is_finished() && self.failed == 0
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} running={} succeeded={} failed={}",
            self.pending, self.running, self.succeeded, self.failed
        )
    }
}
