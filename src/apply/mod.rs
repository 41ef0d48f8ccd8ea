pub mod insert_group;
pub mod partition;
pub mod session;
pub mod sync_apply;
pub mod worker;

use crate::config::ApplierConfig;
use crate::context::ApplyContext;
use crate::engine::StorageEngine;
use crate::metrics::{ApplierMetrics, ApplierObserver, NullObserver};
use crate::oplog::{OpHandle, OplogEntry};
use std::sync::Arc;

/// The ops one worker applies, in routed order.
pub type WriterVector = Vec<OpHandle>;

/// Owning store for ops synthesized during partitioning (flattened
/// transactions, session-table writes). Writer vectors hold handles into
/// these batches, so the pool must live until every worker has finished;
/// shared ownership through `OpHandle` guarantees that even if the driver
/// drops the pool early.
#[derive(Debug, Default)]
pub struct DerivedOpsPool {
    batches: Vec<Vec<OpHandle>>,
}

impl DerivedOpsPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of a derived batch and returns routable handles to it.
    pub(crate) fn add(&mut self, ops: Vec<OplogEntry>) -> Vec<OpHandle> {
        let handles: Vec<OpHandle> = ops.into_iter().map(Arc::new).collect();
        self.batches.push(handles.clone());
        handles
    }

    pub fn batches(&self) -> &[Vec<OpHandle>] {
        &self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Oplog application core for one secondary node. Holds the engine handle,
/// the observer, the shared counters and the apply options; the surrounding
/// replication machinery drives it batch by batch.
pub struct OplogApplier {
    engine: Arc<dyn StorageEngine>,
    observer: Arc<dyn ApplierObserver>,
    metrics: Arc<ApplierMetrics>,
    options: ApplierConfig,
}

impl OplogApplier {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        observer: Arc<dyn ApplierObserver>,
        options: ApplierConfig,
    ) -> Self {
        Self {
            engine,
            observer,
            metrics: Arc::new(ApplierMetrics::default()),
            options,
        }
    }

    pub fn with_null_observer(engine: Arc<dyn StorageEngine>, options: ApplierConfig) -> Self {
        Self::new(engine, Arc::new(NullObserver), options)
    }

    pub fn options(&self) -> &ApplierConfig {
        &self.options
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<ApplierMetrics> {
        &self.metrics
    }

    pub(crate) fn observer(&self) -> &dyn ApplierObserver {
        self.observer.as_ref()
    }

    /// Context for one worker task, inheriting the applier's engine, counters
    /// and slow-op threshold. Workers reconfigure it on entry.
    pub fn new_apply_context(&self) -> ApplyContext {
        let mut ctx = ApplyContext::new(Arc::clone(&self.engine), Arc::clone(&self.metrics));
        ctx.set_slow_op_threshold_ms(self.options.slow_op_threshold_ms);
        ctx
    }
}
