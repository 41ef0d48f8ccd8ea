//! Per-worker application of one writer vector. Workers run in parallel;
//! everything here is local to the worker except the storage engine, the
//! shared counters and the caller-owned multikey report.

use crate::apply::insert_group::InsertGroup;
use crate::apply::sync_apply::sync_apply;
use crate::apply::{OplogApplier, WriterVector};
use crate::config::ApplyMode;
use crate::context::{ApplyContext, PrepareConflictBehavior, ReadSource};
use crate::error::{ApplierError, ApplierErrorCode};
use crate::multikey::MultikeyPathInfo;
use crate::oplog::OplogEntryBatch;
use tracing::error;

/// Stable sort keeps same-namespace ops in batch order, which is exactly the
/// per-document ordering the partitioner promised.
pub fn stable_sort_by_namespace(ops: &mut WriterVector) {
    ops.sort_by(|left, right| left.ns.cmp(&right.ns));
}

/// Worker entry point: apply one writer vector to completion.
///
/// `worker_multikey_path_info` must be empty on entry; on success it holds
/// whatever index paths went multikey during this worker's applies.
pub fn multi_sync_apply(
    ctx: &mut ApplyContext,
    ops: &mut WriterVector,
    applier: &OplogApplier,
    worker_multikey_path_info: &mut Vec<MultikeyPathInfo>,
) -> Result<(), ApplierError> {
    ctx.set_writes_replicated(false);
    ctx.set_document_validation_enabled(false);
    // Stashing transaction resources swaps the locker out from under any
    // scoped block, so the flag is set directly rather than through a guard.
    ctx.set_conflict_with_secondary_batch_application(false);

    // Later reads in this batch must see this batch's earlier writes.
    ctx.set_read_source(ReadSource::NoTimestamp);

    // Secondaries may hit prepare conflicts the primary never saw, e.g. an
    // index read landing adjacent to a prepared but uncommitted key.
    ctx.set_prepare_conflict_behavior(PrepareConflictBehavior::IgnoreConflictsAllowWrites);

    stable_sort_by_namespace(ops);

    let mode = applier.options().mode;
    let allow_namespace_not_found = applier
        .options()
        .allow_namespace_not_found_errors_on_crud_ops;
    let insert_group = InsertGroup::new(applier.options());

    {
        let _tracking = ctx.multikey_tracker().start_tracking();

        let mut index = 0;
        while index < ops.len() {
            // A successful group advances past everything it covered.
            if let Some(last) = insert_group.group_and_apply_inserts(ctx, ops, index, mode) {
                index = last + 1;
                continue;
            }

            let entry = &ops[index];
            match sync_apply(ctx, OplogEntryBatch::single(entry), mode) {
                Ok(()) => {}
                Err(e)
                    if e.code() == ApplierErrorCode::UpdateOperationFailed
                        && mode == ApplyMode::InitialSync =>
                {
                    // The document is missing because a later delete in this
                    // clone's oplog window removes it; that delete reconciles.
                }
                Err(e)
                    if e.code() == ApplierErrorCode::NamespaceNotFound
                        && entry.is_crud()
                        && allow_namespace_not_found =>
                {
                    // The collection is dropped before sync or recovery ends.
                }
                Err(e) => {
                    error!(
                        error = %e,
                        op = %entry.redacted(),
                        "error applying operation"
                    );
                    return Err(e);
                }
            }
            index += 1;
        }
    }

    assert!(
        !ctx.multikey_tracker().is_tracking(),
        "multikey tracking must stop before hand-off"
    );
    assert!(
        worker_multikey_path_info.is_empty(),
        "multikey report must be empty on worker entry"
    );
    let new_paths = ctx.multikey_tracker().take_collected();
    if !new_paths.is_empty() {
        *worker_multikey_path_info = new_paths;
    }

    Ok(())
}
