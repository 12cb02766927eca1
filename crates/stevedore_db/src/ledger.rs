//! In-memory stats ledger.
//!
//! Incremental `{count, total_size}` per status, for the global scope and
//! per bucket. Owned exclusively by the store; mutated only while the
//! store's write lock is held, in lockstep with row transitions.

use std::collections::HashMap;
use stevedore_protocol::types::{FileStatus, ScopeStats, StatsSnapshot};

/// One ground-truth aggregate cell, as produced by the GROUP BY rebuild.
#[derive(Debug, Clone)]
pub(crate) struct AggregateRow {
    pub bucket_id: i64,
    pub status: FileStatus,
    pub count: u64,
    pub total_size: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsLedger {
    total: ScopeStats,
    buckets: HashMap<i64, ScopeStats>,
}

impl StatsLedger {
    /// Add rows to a (bucket, status) cell.
    pub fn add(&mut self, bucket_id: i64, status: FileStatus, count: u64, total_size: u64) {
        for scope in [&mut self.total, self.buckets.entry(bucket_id).or_default()] {
            let cell = scope.get_mut(status);
            cell.count += count;
            cell.total_size += total_size;
        }
    }

    /// Remove rows from a (bucket, status) cell.
    ///
    /// Saturates rather than underflows; reconciliation from ground truth
    /// is the corrective path if a count ever drifts.
    pub fn remove(&mut self, bucket_id: i64, status: FileStatus, count: u64, total_size: u64) {
        for scope in [&mut self.total, self.buckets.entry(bucket_id).or_default()] {
            let cell = scope.get_mut(status);
            cell.count = cell.count.saturating_sub(count);
            cell.total_size = cell.total_size.saturating_sub(total_size);
        }
    }

    /// Move rows between statuses within one bucket.
    pub fn transition(
        &mut self,
        bucket_id: i64,
        from: FileStatus,
        to: FileStatus,
        count: u64,
        total_size: u64,
    ) {
        self.remove(bucket_id, from, count, total_size);
        self.add(bucket_id, to, count, total_size);
    }

    /// Drop a bucket's scope entirely (bucket deletion). The caller has
    /// already removed the bucket's rows status by status.
    pub fn drop_bucket(&mut self, bucket_id: i64) {
        self.buckets.remove(&bucket_id);
    }

    /// Replace the entire ledger with ground-truth aggregates.
    pub fn replace(&mut self, rows: Vec<AggregateRow>) {
        self.total = ScopeStats::default();
        self.buckets.clear();
        for row in rows {
            self.add(row.bucket_id, row.status, row.count, row.total_size);
        }
        self.buckets.retain(|_, scope| !scope.is_empty());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.clone(),
            buckets: self
                .buckets
                .iter()
                .filter(|(_, scope)| !scope.is_empty())
                .map(|(id, scope)| (*id, scope.clone()))
                .collect(),
        }
    }

    pub fn matches(&self, other: &StatsLedger) -> bool {
        self.snapshot_normalized() == other.snapshot_normalized()
    }

    fn snapshot_normalized(&self) -> (ScopeStats, Vec<(i64, ScopeStats)>) {
        let snapshot = self.snapshot();
        let mut buckets: Vec<_> = snapshot.buckets.into_iter().collect();
        buckets.sort_by_key(|(id, _)| *id);
        (snapshot.total, buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_transition() {
        let mut ledger = StatsLedger::default();
        ledger.add(1, FileStatus::Pending, 3, 300);
        ledger.transition(1, FileStatus::Pending, FileStatus::InProgress, 1, 100);

        let snap = ledger.snapshot();
        assert_eq!(snap.total.pending.count, 2);
        assert_eq!(snap.total.pending.total_size, 200);
        assert_eq!(snap.total.in_progress.count, 1);
        assert_eq!(snap.buckets[&1].in_progress.total_size, 100);
    }

    #[test]
    fn global_scope_spans_buckets() {
        let mut ledger = StatsLedger::default();
        ledger.add(1, FileStatus::Completed, 2, 20);
        ledger.add(2, FileStatus::Completed, 1, 5);

        let snap = ledger.snapshot();
        assert_eq!(snap.total.completed.count, 3);
        assert_eq!(snap.total.completed.total_size, 25);
        assert_eq!(snap.buckets[&1].completed.count, 2);
        assert_eq!(snap.buckets[&2].completed.count, 1);
    }

    #[test]
    fn replace_matches_incremental() {
        let mut incremental = StatsLedger::default();
        incremental.add(1, FileStatus::Pending, 2, 64);
        incremental.transition(1, FileStatus::Pending, FileStatus::Completed, 1, 32);

        let mut rebuilt = StatsLedger::default();
        rebuilt.replace(vec![
            AggregateRow {
                bucket_id: 1,
                status: FileStatus::Pending,
                count: 1,
                total_size: 32,
            },
            AggregateRow {
                bucket_id: 1,
                status: FileStatus::Completed,
                count: 1,
                total_size: 32,
            },
        ]);

        assert!(incremental.matches(&rebuilt));
    }

    #[test]
    fn remove_saturates() {
        let mut ledger = StatsLedger::default();
        ledger.add(1, FileStatus::Error, 1, 10);
        ledger.remove(1, FileStatus::Error, 5, 100);
        let snap = ledger.snapshot();
        assert_eq!(snap.total.error.count, 0);
        assert_eq!(snap.total.error.total_size, 0);
    }
}
