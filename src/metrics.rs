//! Write-path metrics.

use std::time::Duration;

/// Counters recorded by the commit coordinator, one update per saved
/// version. Snapshots are read through [`Db::metrics`](crate::Db::metrics).
#[derive(Debug, Default, Clone)]
pub struct WriteMetrics {
    /// Number of committed versions.
    pub writes: u64,
    /// Total wall time spent waiting on writer acknowledgements.
    pub write_time: Duration,
    /// Per-commit durations, in commit order.
    pub write_durations: Vec<Duration>,
    /// Total leaf rows handed to the leaf writer.
    pub write_leaves: i64,
    /// Total branch rows handed to the branch writer.
    pub write_branches: i64,
}

impl WriteMetrics {
    pub(crate) fn record(&mut self, dur: Duration, leaves: i64, branches: i64) {
        self.writes += 1;
        self.write_time += dur;
        self.write_durations.push(dur);
        self.write_leaves += leaves;
        self.write_branches += branches;
    }
}
