use crate::oplog::OpHandle;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every worker of one applier. The ops-applied counter
/// is the replication-lag signal surfaced in server status.
#[derive(Debug, Default)]
pub struct ApplierMetrics {
    ops_applied: AtomicU64,
    write_conflicts_retried: AtomicU64,
    insert_groups_applied: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplierMetricsSnapshot {
    pub ops_applied: u64,
    pub write_conflicts_retried: u64,
    pub insert_groups_applied: u64,
}

impl ApplierMetrics {
    pub fn increment_ops_applied(&self, n: u64) {
        self.ops_applied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_write_conflicts_retried(&self) {
        self.write_conflicts_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_insert_groups_applied(&self) {
        self.insert_groups_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ApplierMetricsSnapshot {
        ApplierMetricsSnapshot {
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            write_conflicts_retried: self.write_conflicts_retried.load(Ordering::Relaxed),
            insert_groups_applied: self.insert_groups_applied.load(Ordering::Relaxed),
        }
    }
}

/// Hook for the replication layer above the applier. Default implementations
/// observe nothing.
pub trait ApplierObserver: Send + Sync {
    fn on_batch_begin(&self, _ops: &[OpHandle]) {}
}

/// Observer used when the caller does not install one.
#[derive(Debug, Default)]
pub struct NullObserver;

impl ApplierObserver for NullObserver {}
