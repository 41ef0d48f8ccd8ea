//! Bulk-insert coalescing. Secondaries see long runs of inserts into the
//! same collection after the namespace sort; applying them one write at a
//! time wastes the storage engine's batch path.

use crate::apply::sync_apply::sync_apply;
use crate::config::{ApplierConfig, ApplyMode};
use crate::context::ApplyContext;
use crate::oplog::{OpHandle, OpType, OplogEntryBatch};
use tracing::debug;

pub(crate) struct InsertGroup {
    max_ops: usize,
    max_bytes: usize,
}

impl InsertGroup {
    pub(crate) fn new(config: &ApplierConfig) -> Self {
        Self {
            max_ops: config.insert_group_max_ops,
            max_bytes: config.insert_group_max_bytes,
        }
    }

    /// Try to apply a run of consecutive inserts starting at `start` as one
    /// bulk write. Returns the index of the last grouped op on success.
    /// Anything else (no viable group, or the grouped apply failing) leaves
    /// state untouched and returns `None` so the caller applies individually.
    ///
    /// Grouped application is semantically equivalent to per-op application
    /// only for non-capped collections, hence the capped-mark check.
    pub(crate) fn group_and_apply_inserts(
        &self,
        ctx: &ApplyContext,
        ops: &[OpHandle],
        start: usize,
        mode: ApplyMode,
    ) -> Option<usize> {
        let first = &ops[start];
        if first.op_type != OpType::Insert || first.is_for_capped_collection() {
            return None;
        }

        let mut total_bytes = first.payload_size();
        let mut end = start + 1;
        while end < ops.len() && end - start < self.max_ops {
            let candidate = &ops[end];
            if candidate.op_type != OpType::Insert
                || candidate.is_for_capped_collection()
                || !same_collection(first, candidate)
            {
                break;
            }
            let payload = candidate.payload_size();
            if total_bytes + payload > self.max_bytes {
                break;
            }
            total_bytes += payload;
            end += 1;
        }

        // A group of one is just the individual path with extra steps.
        if end - start < 2 {
            return None;
        }

        match sync_apply(ctx, OplogEntryBatch::grouped(&ops[start..end]), mode) {
            Ok(()) => {
                ctx.metrics().increment_insert_groups_applied();
                Some(end - 1)
            }
            Err(e) => {
                debug!(
                    error = %e,
                    ns = %first.ns,
                    ops = end - start,
                    "grouped insert failed, falling back to individual application"
                );
                None
            }
        }
    }
}

fn same_collection(a: &OpHandle, b: &OpHandle) -> bool {
    match (a.uuid, b.uuid) {
        (Some(left), Some(right)) => left == right,
        _ => a.ns == b.ns,
    }
}
