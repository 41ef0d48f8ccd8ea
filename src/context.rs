use crate::engine::StorageEngine;
use crate::error::{ApplierError, ApplierErrorCode};
use crate::metrics::ApplierMetrics;
use crate::multikey::MultikeyPathTracker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where storage reads of this context are anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadSource {
    /// Read at the last applied timestamp (steady-state reads).
    #[default]
    LastApplied,
    /// Read the newest committed state regardless of timestamps. Batch
    /// application must see its own earlier writes.
    NoTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareConflictBehavior {
    #[default]
    Enforce,
    /// Secondaries may see prepared state the primary never had; reads skip
    /// the conflict and writes proceed.
    IgnoreConflictsAllowWrites,
}

/// Per-worker operation context. One worker configures its context once at
/// the top of its vector and every apply under it inherits the settings.
pub struct ApplyContext {
    engine: Arc<dyn StorageEngine>,
    metrics: Arc<ApplierMetrics>,
    writes_replicated: bool,
    document_validation_enabled: bool,
    conflict_with_secondary_batch_application: bool,
    read_source: ReadSource,
    prepare_conflict_behavior: PrepareConflictBehavior,
    slow_op_threshold_ms: u64,
    multikey_tracker: MultikeyPathTracker,
}

impl ApplyContext {
    pub fn new(engine: Arc<dyn StorageEngine>, metrics: Arc<ApplierMetrics>) -> Self {
        Self {
            engine,
            metrics,
            writes_replicated: true,
            document_validation_enabled: true,
            conflict_with_secondary_batch_application: true,
            read_source: ReadSource::default(),
            prepare_conflict_behavior: PrepareConflictBehavior::default(),
            slow_op_threshold_ms: 100,
            multikey_tracker: MultikeyPathTracker::default(),
        }
    }

    pub fn engine(&self) -> &dyn StorageEngine {
        self.engine.as_ref()
    }

    pub fn metrics(&self) -> &ApplierMetrics {
        &self.metrics
    }

    pub fn writes_replicated(&self) -> bool {
        self.writes_replicated
    }

    pub fn set_writes_replicated(&mut self, value: bool) {
        self.writes_replicated = value;
    }

    pub fn document_validation_enabled(&self) -> bool {
        self.document_validation_enabled
    }

    pub fn set_document_validation_enabled(&mut self, value: bool) {
        self.document_validation_enabled = value;
    }

    pub fn conflicts_with_secondary_batch_application(&self) -> bool {
        self.conflict_with_secondary_batch_application
    }

    pub fn set_conflict_with_secondary_batch_application(&mut self, value: bool) {
        self.conflict_with_secondary_batch_application = value;
    }

    pub fn read_source(&self) -> ReadSource {
        self.read_source
    }

    pub fn set_read_source(&mut self, source: ReadSource) {
        self.read_source = source;
    }

    pub fn prepare_conflict_behavior(&self) -> PrepareConflictBehavior {
        self.prepare_conflict_behavior
    }

    pub fn set_prepare_conflict_behavior(&mut self, behavior: PrepareConflictBehavior) {
        self.prepare_conflict_behavior = behavior;
    }

    pub fn slow_op_threshold_ms(&self) -> u64 {
        self.slow_op_threshold_ms
    }

    pub fn set_slow_op_threshold_ms(&mut self, ms: u64) {
        self.slow_op_threshold_ms = ms;
    }

    pub fn multikey_tracker(&self) -> &MultikeyPathTracker {
        &self.multikey_tracker
    }
}

/// Re-run `thunk` until it stops reporting a write conflict. Conflicts only
/// arise from concurrent writers, which drain, so the loop is unbounded.
/// Every other outcome passes through unchanged.
pub fn write_conflict_retry<T>(
    ctx: &ApplyContext,
    label: &str,
    ns: &str,
    mut thunk: impl FnMut() -> Result<T, ApplierError>,
) -> Result<T, ApplierError> {
    let mut attempts: u64 = 0;
    loop {
        match thunk() {
            Err(e) if e.code() == ApplierErrorCode::WriteConflict => {
                attempts += 1;
                ctx.metrics().increment_write_conflicts_retried();
                debug!(label, ns, attempts, "write conflict, retrying");
                if attempts.is_multiple_of(1000) {
                    warn!(label, ns, attempts, "write conflict retry is not making progress");
                }
                std::thread::sleep(backoff_for_attempt(attempts));
            }
            other => return other,
        }
    }
}

fn backoff_for_attempt(attempts: u64) -> Duration {
    Duration::from_micros(attempts.min(10) * 100)
}
