//! Session-table maintenance derived from the batch itself. Retryable
//! writes advance a per-session record; the applier persists those records
//! through synthetic update ops on the session table, routed like any other
//! op.

use crate::oplog::{OpTime, OplogEntry, SessionId};
use serde_json::json;
use std::collections::BTreeMap;

pub(crate) const SESSION_TABLE_NS: &str = "config.transactions";

#[derive(Debug, Clone, Copy)]
struct SessionRecord {
    txn_number: i64,
    last_write_op_time: OpTime,
}

/// Accumulates the newest state per session across one batch. Keyed by a
/// BTreeMap so emission order, and therefore routing, is deterministic.
#[derive(Debug, Default)]
pub struct SessionUpdateTracker {
    sessions: BTreeMap<SessionId, SessionRecord>,
}

impl SessionUpdateTracker {
    /// Observe one op in batch order. Returns synthetic session-table writes
    /// that must route *before* the op itself does: a direct write to the
    /// session table flushes the buffered record it would otherwise race.
    pub fn update_session(&mut self, op: &OplogEntry) -> Option<Vec<OplogEntry>> {
        if targets_session_table(op) {
            return self.flush_superseded_by(op);
        }

        // Multi-entry transactions maintain their session record through the
        // transaction machinery; only retryable writes are tracked here.
        if op.is_crud() || op.op_type == crate::oplog::OpType::Noop {
            if let (Some(session_id), Some(txn_number)) = (op.session_id, op.txn_number) {
                self.observe(session_id, txn_number, op.op_time);
            }
        }
        None
    }

    fn observe(&mut self, session_id: SessionId, txn_number: i64, op_time: OpTime) {
        let record = self.sessions.entry(session_id).or_insert(SessionRecord {
            txn_number,
            last_write_op_time: op_time,
        });
        if (txn_number, op_time) >= (record.txn_number, record.last_write_op_time) {
            record.txn_number = txn_number;
            record.last_write_op_time = op_time;
        }
    }

    fn flush_superseded_by(&mut self, op: &OplogEntry) -> Option<Vec<OplogEntry>> {
        if op.is_crud() {
            // A direct write addresses one session document.
            let session_id = session_id_of_table_write(op)?;
            let record = self.sessions.remove(&session_id)?;
            return Some(vec![session_update_op(session_id, record)]);
        }
        // Commands against config (dropping the table, most notably)
        // invalidate everything buffered.
        let flushed = self.flush_all();
        if flushed.is_empty() { None } else { Some(flushed) }
    }

    /// Drain every buffered record into synthetic update ops, in session-id
    /// order.
    pub fn flush_all(&mut self) -> Vec<OplogEntry> {
        let sessions = std::mem::take(&mut self.sessions);
        sessions
            .into_iter()
            .map(|(session_id, record)| session_update_op(session_id, record))
            .collect()
    }
}

fn targets_session_table(op: &OplogEntry) -> bool {
    op.ns == SESSION_TABLE_NS || (op.op_type == crate::oplog::OpType::Command && op.ns == "config.$cmd")
}

fn session_id_of_table_write(op: &OplogEntry) -> Option<SessionId> {
    let id = op.id_element()?.as_str()?;
    Some(SessionId(uuid::Uuid::parse_str(id).ok()?))
}

fn session_update_op(session_id: SessionId, record: SessionRecord) -> OplogEntry {
    OplogEntry::update(
        SESSION_TABLE_NS,
        json!({"_id": session_id.to_string()}),
        json!({
            "_id": session_id.to_string(),
            "txnNum": record.txn_number,
            "lastWriteOpTime": {"term": record.last_write_op_time.term, "ts": record.last_write_op_time.ts},
        }),
        record.last_write_op_time,
    )
}
