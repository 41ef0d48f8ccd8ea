use crate::oplog::OpTime;

/// What the replication state machine is doing while this batch applies.
/// Several error dispositions and the upsert policy depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Secondary,
    InitialSync,
    Recovering,
}

/// Runtime configuration for one oplog applier.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    pub mode: ApplyMode,
    /// Exclusive lower bound: ops at or below this optime are not applied.
    pub begin_applying_op_time: OpTime,
    pub allow_namespace_not_found_errors_on_crud_ops: bool,
    pub slow_op_threshold_ms: u64,
    pub writer_threads: usize,
    pub insert_group_max_ops: usize,
    pub insert_group_max_bytes: usize,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            mode: ApplyMode::Secondary,
            begin_applying_op_time: OpTime::default(),
            allow_namespace_not_found_errors_on_crud_ops: false,
            slow_op_threshold_ms: 100,
            writer_threads: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
            insert_group_max_ops: 64,
            insert_group_max_bytes: 512 * 1024,
        }
    }
}

impl ApplierConfig {
    /// Initial sync replays a data clone's oplog window. Collections may be
    /// dropped before the window ends, so missing namespaces on CRUD ops are
    /// tolerated.
    pub fn initial_sync(begin_applying_op_time: OpTime) -> Self {
        Self {
            mode: ApplyMode::InitialSync,
            begin_applying_op_time,
            allow_namespace_not_found_errors_on_crud_ops: true,
            ..Self::default()
        }
    }

    pub fn recovering() -> Self {
        Self {
            mode: ApplyMode::Recovering,
            allow_namespace_not_found_errors_on_crud_ops: true,
            ..Self::default()
        }
    }

    pub fn is_initial_sync(&self) -> bool {
        matches!(self.mode, ApplyMode::InitialSync)
    }
}
