//! Scripted in-memory storage engine for exercising the applier without a
//! real storage stack: collections with capped flags and collators, recorded
//! lock and apply activity, and injectable failures.

#![allow(dead_code)]

use oplog_applier::apply::{DerivedOpsPool, OplogApplier, WriterVector};
use oplog_applier::config::{ApplierConfig, ApplyMode};
use oplog_applier::context::ApplyContext;
use oplog_applier::engine::{
    Collation, CollectionInfo, DatabaseLock, LockMode, NamespaceOrUuid, StorageEngine,
};
use oplog_applier::error::ApplierError;
use oplog_applier::multikey::MultikeyPathInfo;
use oplog_applier::oplog::{
    extract_operations, OpHandle, OplogEntry, OplogEntryBatch, OpTime, OpType, SessionId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

struct CollectionState {
    uuid: Uuid,
    is_capped: bool,
    collator: Option<Collation>,
    docs: Vec<(String, Value)>,
    multikey_on_insert: Option<MultikeyPathInfo>,
}

#[derive(Default)]
struct EngineState {
    databases: HashSet<String>,
    collections: HashMap<String, CollectionState>,
    lock_log: Vec<(String, LockMode)>,
    /// `(ns, optime ts)` per applied CRUD op, in apply order.
    applied: Vec<(String, u64)>,
    /// Ops per `apply_operation` invocation, in call order.
    batch_sizes: Vec<usize>,
    commands: Vec<String>,
    apply_calls: usize,
    fail_apply: VecDeque<ApplierError>,
    fail_commands: VecDeque<ApplierError>,
}

pub struct MemoryEngine {
    doc_locking: bool,
    state: Mutex<EngineState>,
}

struct MemoryLock;
impl DatabaseLock for MemoryLock {}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Self::with_doc_locking(true)
    }

    pub fn with_doc_locking(doc_locking: bool) -> Arc<Self> {
        Arc::new(Self {
            doc_locking,
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn create_database(&self, db: &str) {
        self.state.lock().databases.insert(db.to_owned());
    }

    pub fn create_collection(&self, ns: &str) -> Uuid {
        self.create_collection_with(ns, false, None)
    }

    pub fn create_capped_collection(&self, ns: &str) -> Uuid {
        self.create_collection_with(ns, true, None)
    }

    pub fn create_collection_with(
        &self,
        ns: &str,
        is_capped: bool,
        collator: Option<Collation>,
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        let mut state = self.state.lock();
        state
            .databases
            .insert(ns.split_once('.').map_or(ns, |(db, _)| db).to_owned());
        state.collections.insert(
            ns.to_owned(),
            CollectionState {
                uuid,
                is_capped,
                collator,
                docs: Vec::new(),
                multikey_on_insert: None,
            },
        );
        uuid
    }

    pub fn set_multikey_on_insert(&self, ns: &str, info: MultikeyPathInfo) {
        self.state
            .lock()
            .collections
            .get_mut(ns)
            .expect("collection exists")
            .multikey_on_insert = Some(info);
    }

    pub fn inject_apply_failure(&self, err: ApplierError) {
        self.state.lock().fail_apply.push_back(err);
    }

    pub fn inject_command_failure(&self, err: ApplierError) {
        self.state.lock().fail_commands.push_back(err);
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().apply_calls
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub fn applied_order(&self) -> Vec<(String, u64)> {
        self.state.lock().applied.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn lock_log(&self) -> Vec<(String, LockMode)> {
        self.state.lock().lock_log.clone()
    }

    pub fn doc_ids(&self, ns: &str) -> Vec<String> {
        self.state
            .lock()
            .collections
            .get(ns)
            .map(|coll| coll.docs.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }
}

fn id_key(value: &Value) -> String {
    value.to_string()
}

impl StorageEngine for MemoryEngine {
    fn supports_doc_locking(&self) -> bool {
        self.doc_locking
    }

    fn lookup_namespace_by_uuid(&self, uuid: &Uuid) -> Option<String> {
        let state = self.state.lock();
        state
            .collections
            .iter()
            .find(|(_, coll)| coll.uuid == *uuid)
            .map(|(ns, _)| ns.clone())
    }

    fn lock_database(&self, db: &str, mode: LockMode) -> Box<dyn DatabaseLock> {
        self.state.lock().lock_log.push((db.to_owned(), mode));
        Box::new(MemoryLock)
    }

    fn database_exists(&self, db: &str) -> bool {
        self.state.lock().databases.contains(db)
    }

    fn collection_info(&self, ns: &str) -> Option<CollectionInfo> {
        let state = self.state.lock();
        state.collections.get(ns).map(|coll| CollectionInfo {
            is_capped: coll.is_capped,
            collator: coll.collator.clone(),
        })
    }

    fn apply_operation(
        &self,
        ctx: &ApplyContext,
        locator: &NamespaceOrUuid,
        batch: OplogEntryBatch<'_>,
        should_always_upsert: bool,
        _mode: ApplyMode,
        on_applied: &(dyn Fn() + Sync),
    ) -> Result<(), ApplierError> {
        let ns = match locator {
            NamespaceOrUuid::Namespace(ns) => ns.clone(),
            NamespaceOrUuid::Uuid { uuid, .. } => {
                self.lookup_namespaces_or_fail(uuid)?
            }
        };

        let mut multikey = None;
        {
            let mut state = self.state.lock();
            state.apply_calls += 1;
            state.batch_sizes.push(batch.ops().len());
            if let Some(err) = state.fail_apply.pop_front() {
                return Err(err);
            }
            if !state.collections.contains_key(&ns) {
                return Err(ApplierError::NamespaceNotFound(ns));
            }

            for op in batch.ops() {
                let id = op
                    .id_element()
                    .map(id_key)
                    .ok_or_else(|| {
                        ApplierError::InvalidEntry(format!("op without _id: {}", op.redacted()))
                    })?;
                let coll = state.collections.get_mut(&ns).expect("checked above");
                match op.op_type {
                    OpType::Insert => {
                        coll.docs.push((id, op.object.clone()));
                        if let Some(info) = &coll.multikey_on_insert {
                            multikey = Some(info.clone());
                        }
                    }
                    OpType::Update => {
                        if let Some(slot) =
                            coll.docs.iter_mut().find(|(doc_id, _)| *doc_id == id)
                        {
                            slot.1 = op.object.clone();
                        } else if should_always_upsert {
                            coll.docs.push((id, op.object.clone()));
                        } else {
                            return Err(ApplierError::UpdateOperationFailed(ns.clone()));
                        }
                    }
                    OpType::Delete => {
                        coll.docs.retain(|(doc_id, _)| *doc_id != id);
                    }
                    _ => unreachable!("only CRUD ops reach apply_operation"),
                }
                state.applied.push((ns.clone(), op.op_time.ts));
                on_applied();
            }
        }

        if let Some(info) = multikey {
            ctx.multikey_tracker().add_path_info(info);
        }
        Ok(())
    }

    fn apply_command(
        &self,
        _ctx: &ApplyContext,
        entry: &OplogEntry,
        _mode: ApplyMode,
    ) -> Result<(), ApplierError> {
        let mut state = self.state.lock();
        state.commands.push(entry.object.to_string());
        if let Some(err) = state.fail_commands.pop_front() {
            return Err(err);
        }
        if let Some(name) = entry.object.get("create").and_then(Value::as_str) {
            let db = entry.ns.split_once('.').map_or(entry.ns.as_str(), |(db, _)| db);
            let ns = format!("{db}.{name}");
            state.databases.insert(db.to_owned());
            state.collections.insert(
                ns,
                CollectionState {
                    uuid: Uuid::new_v4(),
                    is_capped: false,
                    collator: None,
                    docs: Vec::new(),
                    multikey_on_insert: None,
                },
            );
        }
        Ok(())
    }

    fn read_transaction_operations_from_oplog_chain(
        &self,
        _ctx: &ApplyContext,
        terminal: &OplogEntry,
        partial: &[OpHandle],
    ) -> Result<Vec<OplogEntry>, ApplierError> {
        let mut ops = Vec::new();
        for entry in partial {
            ops.extend(extract_operations(entry)?);
        }
        // A prepared commit carries no inline payload of its own.
        if terminal.object.get("applyOps").is_some() {
            ops.extend(extract_operations(terminal)?);
        }
        Ok(ops)
    }
}

impl MemoryEngine {
    fn lookup_namespaces_or_fail(&self, uuid: &Uuid) -> Result<String, ApplierError> {
        self.lookup_namespace_by_uuid(uuid)
            .ok_or_else(|| ApplierError::NamespaceNotFound(format!("no namespace with UUID {uuid}")))
    }
}

// ---- op builders ----------------------------------------------------------

pub fn handle(entry: OplogEntry) -> OpHandle {
    Arc::new(entry)
}

pub fn insert_op(ns: &str, id: u64, ts: u64) -> OpHandle {
    handle(OplogEntry::insert(ns, json!({"_id": id}), OpTime::new(1, ts)))
}

pub fn update_op(ns: &str, id: u64, ts: u64) -> OpHandle {
    handle(OplogEntry::update(
        ns,
        json!({"_id": id}),
        json!({"_id": id, "updated": true}),
        OpTime::new(1, ts),
    ))
}

pub fn delete_op(ns: &str, id: u64, ts: u64) -> OpHandle {
    handle(OplogEntry::delete(ns, json!({"_id": id}), OpTime::new(1, ts)))
}

/// A non-final entry of a multi-entry transaction carrying `inner` CRUD ops.
pub fn partial_txn_op(
    session_id: SessionId,
    txn_number: i64,
    inner: Vec<Value>,
    ts: u64,
) -> OpHandle {
    handle(
        OplogEntry::command(
            "admin",
            json!({"applyOps": inner, "partialTxn": true}),
            OpTime::new(1, ts),
        )
        .with_session(session_id, txn_number)
        .with_prev_write_op_time(OpTime::new(1, ts.saturating_sub(1))),
    )
}

/// The commit entry of an unprepared transaction.
pub fn terminal_apply_ops(
    session_id: SessionId,
    txn_number: i64,
    inner: Vec<Value>,
    ts: u64,
) -> OpHandle {
    handle(
        OplogEntry::command("admin", json!({"applyOps": inner, "count": 1}), OpTime::new(1, ts))
            .with_session(session_id, txn_number)
            .with_prev_write_op_time(OpTime::new(1, ts.saturating_sub(1))),
    )
}

pub fn abort_txn_op(session_id: SessionId, txn_number: i64, ts: u64) -> OpHandle {
    handle(
        OplogEntry::command("admin", json!({"abortTransaction": 1}), OpTime::new(1, ts))
            .with_session(session_id, txn_number),
    )
}

pub fn inner_insert(ns: &str, id: u64) -> Value {
    json!({"op": "i", "ns": ns, "o": {"_id": id}})
}

// ---- applier plumbing -----------------------------------------------------

pub fn applier(engine: Arc<MemoryEngine>, config: ApplierConfig) -> OplogApplier {
    OplogApplier::with_null_observer(engine, config)
}

pub fn fill(
    applier: &OplogApplier,
    ops: &[OpHandle],
    writers: usize,
) -> (Vec<WriterVector>, DerivedOpsPool) {
    let ctx = applier.new_apply_context();
    let mut writer_vectors: Vec<WriterVector> = vec![Vec::new(); writers];
    let mut derived_ops = DerivedOpsPool::new();
    applier
        .fill_writer_vectors(&ctx, ops, &mut writer_vectors, &mut derived_ops)
        .expect("fill_writer_vectors");
    (writer_vectors, derived_ops)
}

/// Context configured the way a worker configures it, for driving
/// `sync_apply` directly.
pub fn worker_ctx(applier: &OplogApplier) -> ApplyContext {
    let mut ctx = applier.new_apply_context();
    ctx.set_writes_replicated(false);
    ctx.set_document_validation_enabled(false);
    ctx
}

/// All routed ops across writer vectors as `(worker, ns, optime ts)`.
pub fn routed(writer_vectors: &[WriterVector]) -> Vec<(usize, String, u64)> {
    writer_vectors
        .iter()
        .enumerate()
        .flat_map(|(worker, ops)| {
            ops.iter()
                .map(move |op| (worker, op.ns.clone(), op.op_time.ts))
        })
        .collect()
}
