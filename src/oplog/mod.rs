use crate::error::ApplierError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Logical timestamp of an oplog entry: election term plus a position within
/// the term. The default value sorts below every real optime and doubles as
/// the "no floor" sentinel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    pub term: u64,
    pub ts: u64,
}

impl OpTime {
    pub fn new(term: u64, ts: u64) -> Self {
        Self { term, ts }
    }

    pub fn is_null(&self) -> bool {
        *self == OpTime::default()
    }
}

impl std::fmt::Display for OpTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.term, self.ts)
    }
}

/// Logical session identifier. Ordered so that anything iterating sessions
/// (derived-op emission in particular) produces a deterministic sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SessionId(pub Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "n")]
    Noop,
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "c")]
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    ApplyOps,
    AbortTransaction,
    CommitTransaction,
    Generic,
}

/// One parsed replication log record.
///
/// `for_capped_collection` is the only mutable part: batch partitioning marks
/// capped-collection inserts so the insert grouper refuses to coalesce them.
/// The mark is atomic because writer vectors share entries across worker
/// threads.
#[derive(Debug, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_type: OpType,
    /// Dotted `db.collection` target.
    pub ns: String,
    pub uuid: Option<Uuid>,
    pub op_time: OpTime,
    /// The operation payload: the document for inserts, the modification for
    /// updates, the key for deletes, the command body for commands.
    pub object: Value,
    /// Update criteria (the document key for updates).
    pub object2: Option<Value>,
    pub session_id: Option<SessionId>,
    pub txn_number: Option<i64>,
    pub prev_write_op_time_in_txn: Option<OpTime>,
    #[serde(skip)]
    pub for_capped_collection: AtomicBool,
}

impl Clone for OplogEntry {
    fn clone(&self) -> Self {
        Self {
            op_type: self.op_type,
            ns: self.ns.clone(),
            uuid: self.uuid,
            op_time: self.op_time,
            object: self.object.clone(),
            object2: self.object2.clone(),
            session_id: self.session_id,
            txn_number: self.txn_number,
            prev_write_op_time_in_txn: self.prev_write_op_time_in_txn,
            for_capped_collection: AtomicBool::new(self.is_for_capped_collection()),
        }
    }
}

impl OplogEntry {
    fn new(op_type: OpType, ns: impl Into<String>, object: Value, op_time: OpTime) -> Self {
        Self {
            op_type,
            ns: ns.into(),
            uuid: None,
            op_time,
            object,
            object2: None,
            session_id: None,
            txn_number: None,
            prev_write_op_time_in_txn: None,
            for_capped_collection: AtomicBool::new(false),
        }
    }

    pub fn insert(ns: impl Into<String>, doc: Value, op_time: OpTime) -> Self {
        Self::new(OpType::Insert, ns, doc, op_time)
    }

    pub fn update(
        ns: impl Into<String>,
        criteria: Value,
        modification: Value,
        op_time: OpTime,
    ) -> Self {
        let mut entry = Self::new(OpType::Update, ns, modification, op_time);
        entry.object2 = Some(criteria);
        entry
    }

    pub fn delete(ns: impl Into<String>, key: Value, op_time: OpTime) -> Self {
        Self::new(OpType::Delete, ns, key, op_time)
    }

    pub fn command(db: &str, body: Value, op_time: OpTime) -> Self {
        Self::new(OpType::Command, format!("{db}.$cmd"), body, op_time)
    }

    pub fn noop(ns: impl Into<String>, body: Value, op_time: OpTime) -> Self {
        Self::new(OpType::Noop, ns, body, op_time)
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_session(mut self, session_id: SessionId, txn_number: i64) -> Self {
        self.session_id = Some(session_id);
        self.txn_number = Some(txn_number);
        self
    }

    pub fn with_prev_write_op_time(mut self, prev: OpTime) -> Self {
        self.prev_write_op_time_in_txn = Some(prev);
        self
    }

    pub fn db_name(&self) -> &str {
        self.ns.split_once('.').map_or(self.ns.as_str(), |(db, _)| db)
    }

    pub fn is_crud(&self) -> bool {
        matches!(self.op_type, OpType::Insert | OpType::Update | OpType::Delete)
    }

    /// Command classification by payload shape. Field order in the body is
    /// not significant, so classification is by presence of the known keys.
    pub fn command_type(&self) -> Option<CommandType> {
        if self.op_type != OpType::Command {
            return None;
        }
        let body = self.object.as_object()?;
        if body.contains_key("applyOps") {
            Some(CommandType::ApplyOps)
        } else if body.contains_key("abortTransaction") {
            Some(CommandType::AbortTransaction)
        } else if body.contains_key("commitTransaction") {
            Some(CommandType::CommitTransaction)
        } else {
            Some(CommandType::Generic)
        }
    }

    fn apply_ops_flag(&self, flag: &str) -> bool {
        self.command_type() == Some(CommandType::ApplyOps)
            && self
                .object
                .get(flag)
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// A non-final entry of a multi-entry transaction.
    pub fn is_partial_transaction(&self) -> bool {
        self.apply_ops_flag("partialTxn")
    }

    /// The applyOps entry that prepares a transaction.
    pub fn should_prepare(&self) -> bool {
        self.apply_ops_flag("prepare")
    }

    /// The final applyOps of an oplog chain (unprepared commit, or a plain
    /// nested/standalone applyOps).
    pub fn is_terminal_apply_ops(&self) -> bool {
        self.command_type() == Some(CommandType::ApplyOps)
            && !self.is_partial_transaction()
            && !self.should_prepare()
    }

    /// The commit entry of a previously prepared transaction.
    pub fn is_prepared_commit(&self) -> bool {
        self.command_type() == Some(CommandType::CommitTransaction)
    }

    /// The `_id` the op addresses. Updates carry it in the criteria document;
    /// inserts and deletes in the payload itself.
    pub fn id_element(&self) -> Option<&Value> {
        match self.op_type {
            OpType::Update => self
                .object2
                .as_ref()
                .and_then(|criteria| criteria.get("_id"))
                .or_else(|| self.object.get("_id")),
            _ => self.object.get("_id"),
        }
    }

    pub fn is_for_capped_collection(&self) -> bool {
        self.for_capped_collection.load(Ordering::Relaxed)
    }

    pub fn set_for_capped_collection(&self, value: bool) {
        self.for_capped_collection.store(value, Ordering::Relaxed);
    }

    /// Approximate payload size, used by the insert grouper's byte cap.
    pub fn payload_size(&self) -> usize {
        self.object.to_string().len()
    }

    /// Rendering safe for logs: structure kept, document values scrubbed.
    pub fn redacted(&self) -> String {
        format!(
            "{{ op: {:?}, ns: {:?}, opTime: {}, o: {} }}",
            self.op_type,
            self.ns,
            self.op_time,
            redact_value(&self.object)
        )
    }
}

fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v)))
                .collect(),
        ),
        _ => Value::String("###".into()),
    }
}

/// Decompose an applyOps entry into its constituent operations. Extracted
/// operations inherit the outer entry's optime so downstream ordering and
/// floor checks keep working.
pub fn extract_operations(entry: &OplogEntry) -> Result<Vec<OplogEntry>, ApplierError> {
    let ops = entry
        .object
        .get("applyOps")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ApplierError::InvalidEntry(format!(
                "applyOps entry without an operation list: {}",
                entry.redacted()
            ))
        })?;
    ops.iter()
        .map(|inner| operation_from_apply_ops_element(entry, inner))
        .collect()
}

fn operation_from_apply_ops_element(
    outer: &OplogEntry,
    inner: &Value,
) -> Result<OplogEntry, ApplierError> {
    let op_code = inner.get("op").and_then(Value::as_str).ok_or_else(|| {
        ApplierError::InvalidEntry("applyOps element missing op type".into())
    })?;
    let op_type = match op_code {
        "i" => OpType::Insert,
        "u" => OpType::Update,
        "d" => OpType::Delete,
        "n" => OpType::Noop,
        "c" => OpType::Command,
        other => {
            return Err(ApplierError::InvalidEntry(format!(
                "applyOps element has unknown op type {other:?}"
            )));
        }
    };
    let ns = inner.get("ns").and_then(Value::as_str).ok_or_else(|| {
        ApplierError::InvalidEntry("applyOps element missing ns".into())
    })?;
    let object = inner.get("o").cloned().ok_or_else(|| {
        ApplierError::InvalidEntry("applyOps element missing payload".into())
    })?;

    let mut entry = OplogEntry::new(op_type, ns, object, outer.op_time);
    entry.object2 = inner.get("o2").cloned();
    if let Some(uuid) = inner.get("ui").and_then(Value::as_str) {
        entry.uuid = Uuid::parse_str(uuid).ok();
    }
    Ok(entry)
}

/// Shared handle to an oplog entry. The input batch and the derived-op pool
/// own entries through these; writer vectors hold clones, so every routed
/// handle stays valid for the whole worker phase.
pub type OpHandle = Arc<OplogEntry>;

/// View over one op, or over a run of consecutive inserts applied as a single
/// bulk write. The CRUD primitive receives the whole view.
#[derive(Clone, Copy)]
pub struct OplogEntryBatch<'a> {
    ops: &'a [OpHandle],
}

impl<'a> OplogEntryBatch<'a> {
    pub fn single(op: &'a OpHandle) -> Self {
        Self {
            ops: std::slice::from_ref(op),
        }
    }

    /// `ops` must be non-empty, all inserts into the same collection.
    pub fn grouped(ops: &'a [OpHandle]) -> Self {
        debug_assert!(!ops.is_empty());
        Self { ops }
    }

    /// The representative op: dispatch type, namespace and latency reporting
    /// all key off it.
    pub fn leader(&self) -> &'a OplogEntry {
        &self.ops[0]
    }

    pub fn ops(&self) -> &'a [OpHandle] {
        self.ops
    }

    pub fn is_grouped(&self) -> bool {
        self.ops.len() > 1
    }

    pub fn redacted(&self) -> String {
        if self.is_grouped() {
            format!(
                "{{ grouped inserts: {} ops into {:?}, first: {} }}",
                self.ops.len(),
                self.leader().ns,
                self.leader().redacted()
            )
        } else {
            self.leader().redacted()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn op_time_orders_by_term_then_position() {
        assert!(OpTime::new(1, 99) < OpTime::new(1, 100));
        assert!(OpTime::new(1, 100) < OpTime::new(2, 1));
        assert!(OpTime::default() < OpTime::new(1, 1));
        assert!(OpTime::default().is_null());
    }

    #[test]
    fn command_classification_ignores_field_order() {
        let abort = OplogEntry::command("admin", json!({"abortTransaction": 1}), OpTime::new(1, 1));
        assert_eq!(abort.command_type(), Some(CommandType::AbortTransaction));

        let commit =
            OplogEntry::command("admin", json!({"commitTransaction": 1}), OpTime::new(1, 2));
        assert!(commit.is_prepared_commit());

        let create = OplogEntry::command(
            "test",
            json!({"create": "c", "capped": true}),
            OpTime::new(1, 3),
        );
        assert_eq!(create.command_type(), Some(CommandType::Generic));

        let insert = OplogEntry::insert("test.c", json!({"_id": 1}), OpTime::new(1, 4));
        assert_eq!(insert.command_type(), None);
    }

    #[test]
    fn apply_ops_flags_distinguish_partial_prepare_terminal() {
        let partial = OplogEntry::command(
            "admin",
            json!({"applyOps": [], "partialTxn": true}),
            OpTime::new(1, 1),
        );
        assert!(partial.is_partial_transaction());
        assert!(!partial.is_terminal_apply_ops());

        let prepare = OplogEntry::command(
            "admin",
            json!({"applyOps": [], "prepare": true}),
            OpTime::new(1, 2),
        );
        assert!(prepare.should_prepare());
        assert!(!prepare.is_terminal_apply_ops());

        let terminal =
            OplogEntry::command("admin", json!({"applyOps": []}), OpTime::new(1, 3));
        assert!(terminal.is_terminal_apply_ops());
    }

    #[test]
    fn update_id_comes_from_criteria() {
        let update = OplogEntry::update(
            "test.c",
            json!({"_id": 7}),
            json!({"$set": {"x": 1}}),
            OpTime::new(1, 1),
        );
        assert_eq!(update.id_element(), Some(&json!(7)));

        let insert = OplogEntry::insert("test.c", json!({"_id": 3, "x": 2}), OpTime::new(1, 2));
        assert_eq!(insert.id_element(), Some(&json!(3)));
    }

    #[test]
    fn extract_operations_flattens_apply_ops() {
        let entry = OplogEntry::command(
            "admin",
            json!({"applyOps": [
                {"op": "i", "ns": "test.a", "o": {"_id": 1}},
                {"op": "u", "ns": "test.b", "o": {"$set": {"x": 2}}, "o2": {"_id": 2}},
                {"op": "d", "ns": "test.a", "o": {"_id": 1}},
            ]}),
            OpTime::new(3, 9),
        );
        let ops = extract_operations(&entry).expect("extract");
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].op_type, OpType::Insert);
        assert_eq!(ops[0].ns, "test.a");
        assert_eq!(ops[0].op_time, OpTime::new(3, 9));
        assert_eq!(ops[1].op_type, OpType::Update);
        assert_eq!(ops[1].id_element(), Some(&json!(2)));
        assert_eq!(ops[2].op_type, OpType::Delete);
    }

    #[test]
    fn extract_operations_rejects_malformed_payload() {
        let entry = OplogEntry::command("admin", json!({"applyOps": 5}), OpTime::new(1, 1));
        assert!(extract_operations(&entry).is_err());

        let missing_ns = OplogEntry::command(
            "admin",
            json!({"applyOps": [{"op": "i", "o": {"_id": 1}}]}),
            OpTime::new(1, 2),
        );
        assert!(extract_operations(&missing_ns).is_err());
    }

    #[test]
    fn redaction_scrubs_document_values() {
        let entry = OplogEntry::insert(
            "test.c",
            json!({"_id": 1, "secret": "hunter2", "nested": {"k": "v"}}),
            OpTime::new(1, 1),
        );
        let redacted = entry.redacted();
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.contains("###"));
        assert!(redacted.contains("test.c"));
    }

    #[test]
    fn capped_mark_survives_clone() {
        let entry = OplogEntry::insert("test.c", json!({"_id": 1}), OpTime::new(1, 1));
        entry.set_for_capped_collection(true);
        assert!(entry.clone().is_for_capped_collection());
    }
}
