//! Leaf application of one op (or one grouped insert run) under the correct
//! lock, with write-conflict retry handled by the caller-visible wrapper and
//! idempotency exceptions resolved here.

use crate::config::ApplyMode;
use crate::context::{ApplyContext, write_conflict_retry};
use crate::engine::{
    LockMode, fix_lock_mode_for_system_views, namespace_or_uuid, resolve_namespace,
};
use crate::error::{ApplierError, ApplierErrorCode};
use crate::failpoint::HANG_AFTER_RECORDING_OP_APPLICATION_START_TIME;
use crate::oplog::{OpType, OplogEntryBatch};
use std::time::Instant;
use tracing::info;

/// Apply a single op to storage. The context must already be configured for
/// batch application; workers do this once per vector.
pub fn sync_apply(
    ctx: &ApplyContext,
    batch: OplogEntryBatch<'_>,
    mode: ApplyMode,
) -> Result<(), ApplierError> {
    // Guarantees sync_apply's context matches that of its calling worker.
    assert!(
        !ctx.writes_replicated(),
        "oplog application must not replicate its writes"
    );
    assert!(
        !ctx.document_validation_enabled(),
        "oplog application must not re-validate documents"
    );

    let op = batch.leader();
    let apply_start = Instant::now();

    if HANG_AFTER_RECORDING_OP_APPLICATION_START_TIME.should_fail() {
        info!(
            "sync_apply - fail point hang_after_recording_op_application_start_time \
             enabled, blocking until fail point is disabled"
        );
        HANG_AFTER_RECORDING_OP_APPLICATION_START_TIME.pause_while_set();
    }

    match op.op_type {
        OpType::Noop => {
            ctx.metrics().increment_ops_applied(1);
            Ok(())
        }
        OpType::Insert | OpType::Update | OpType::Delete => {
            let result = write_conflict_retry(ctx, "sync_apply_crud", &op.ns, || {
                let ns = resolve_namespace(ctx.engine(), op)?;
                let locator = namespace_or_uuid(&ns, op);
                let _db_lock = ctx.engine().lock_database(
                    locator.db_name(),
                    fix_lock_mode_for_system_views(&ns, LockMode::IntentExclusive),
                );
                if !ctx.engine().database_exists(locator.db_name()) {
                    return Err(ApplierError::NamespaceNotFound(format!(
                        "missing database ({})",
                        locator.db_name()
                    )));
                }

                // Updates become upserts outside initial sync: after rollback
                // and during startup an update may replay after a delete, and
                // those modes do not ignore the miss. Initial sync does, so
                // there is no reason to upsert there.
                let should_always_upsert = mode != ApplyMode::InitialSync;
                ctx.engine().apply_operation(
                    ctx,
                    &locator,
                    batch,
                    should_always_upsert,
                    mode,
                    &|| ctx.metrics().increment_ops_applied(1),
                )
            });
            let result = match result {
                Err(e) if e.code() == ApplierErrorCode::NamespaceNotFound => {
                    // Deletes of missing namespaces are idempotent successes.
                    // Recovery tolerates every CRUD miss: storage does not
                    // wait for drops to be checkpointed.
                    if op.op_type == OpType::Delete || mode == ApplyMode::Recovering {
                        Ok(())
                    } else {
                        Err(e.annotate(format!(
                            "failed to apply operation: {}",
                            batch.redacted()
                        )))
                    }
                }
                other => other,
            };
            finish_and_log_apply(ctx, result, apply_start, batch)
        }
        OpType::Command => {
            let result = write_conflict_retry(ctx, "sync_apply_command", &op.ns, || {
                // Commands pick their own locks and never create databases
                // implicitly.
                let status = ctx.engine().apply_command(ctx, op, mode);
                ctx.metrics().increment_ops_applied(1);
                status
            });
            finish_and_log_apply(ctx, result, apply_start, batch)
        }
    }
}

/// Logs a report of ops that took longer than the slow-op threshold. Called
/// right before returning from `sync_apply`; passes the status through.
fn finish_and_log_apply(
    ctx: &ApplyContext,
    result: Result<(), ApplierError>,
    apply_start: Instant,
    batch: OplogEntryBatch<'_>,
) -> Result<(), ApplierError> {
    if result.is_ok() {
        let elapsed_ms = apply_start.elapsed().as_millis() as u64;
        if let Some(report) = slow_op_report(batch, elapsed_ms, ctx.slow_op_threshold_ms()) {
            info!("{report}");
        }
    }
    result
}

pub(crate) fn slow_op_report(
    batch: OplogEntryBatch<'_>,
    elapsed_ms: u64,
    slow_op_threshold_ms: u64,
) -> Option<String> {
    if elapsed_ms <= slow_op_threshold_ms {
        return None;
    }
    let kind = if batch.leader().op_type == OpType::Command {
        "command"
    } else {
        "CRUD"
    };
    Some(format!(
        "applied op: {kind} {}, took {elapsed_ms}ms",
        batch.redacted()
    ))
}
