use serde::Deserialize;
use serde::Serialize;

/// Aggregate counts and averages over the run history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued_count: u64,
    pub running_count: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub cancelled_count: u64,
    pub total_runs: u64,
    pub avg_wait_seconds: f64,
    pub avg_duration_seconds: f64,
}

impl QueueStats {
    /// Runs that still need attention from the pool.
    pub fn active_count(&self) -> u64 {
        self.queued_count + self.running_count
    }
}
