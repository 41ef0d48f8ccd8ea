//! Batch partitioning: one linear oplog batch becomes W disjoint writer
//! vectors. Ops that must serialize (same document, or same collection when
//! the engine or a capped collection forbids document-level concurrency)
//! share a vector; everything else spreads by hash.

use crate::apply::session::SessionUpdateTracker;
use crate::apply::{DerivedOpsPool, OplogApplier, WriterVector};
use crate::context::ApplyContext;
use crate::engine::{Collation, CollectionInfo, LockMode};
use crate::error::ApplierError;
use crate::oplog::{
    CommandType, OpHandle, OpType, SessionId, extract_operations,
};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Memoizes per-collection properties for one partitioning pass so the
/// catalog is consulted once per namespace, not once per op. Never reused
/// across passes: a later batch may have dropped or recreated collections.
#[derive(Default)]
pub(crate) struct CachedCollectionProperties {
    cache: HashMap<String, CollectionInfo>,
}

impl CachedCollectionProperties {
    pub(crate) fn get(&mut self, ctx: &ApplyContext, ns: &str) -> CollectionInfo {
        if let Some(props) = self.cache.get(ns) {
            return props.clone();
        }
        let props = lookup_collection_properties(ctx, ns);
        self.cache.insert(ns.to_owned(), props.clone());
        props
    }
}

fn lookup_collection_properties(ctx: &ApplyContext, ns: &str) -> CollectionInfo {
    let db = ns.split_once('.').map_or(ns, |(db, _)| db);
    let _db_lock = ctx.engine().lock_database(db, LockMode::IntentShared);
    if !ctx.engine().database_exists(db) {
        return CollectionInfo::default();
    }
    ctx.engine().collection_info(ns).unwrap_or_default()
}

/// 32-bit namespace hash. Truncating the 64-bit hash is fine: the low bits
/// carry the entropy and the value only ever feeds a modulo and a murmur
/// seed.
pub(crate) fn namespace_hash(ns: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    ns.hash(&mut hasher);
    hasher.finish() as u32
}

/// Hash of the op's `_id` under the collection's default collation, with the
/// element's field name ignored. Two ids the collator considers equal must
/// hash equally or same-document ordering breaks across workers.
pub(crate) fn collator_aware_id_hash(id: Option<&Value>, collator: Option<&Collation>) -> u64 {
    let mut hasher = DefaultHasher::new();
    match id {
        Some(value) => hash_value(value, collator, &mut hasher),
        None => 0xffu8.hash(&mut hasher),
    }
    hasher.finish()
}

fn hash_value(value: &Value, collator: Option<&Collation>, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            // Numeric comparisons cross representations, so hash the
            // canonical double form.
            2u8.hash(hasher);
            n.as_f64().unwrap_or(0.0).to_bits().hash(hasher);
        }
        Value::String(s) => {
            3u8.hash(hasher);
            match collator {
                Some(collation) => collation.comparison_key(s).hash(hasher),
                None => s.hash(hasher),
            }
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, collator, hasher);
            }
        }
        Value::Object(map) => {
            // Only the top-level element's name is ignored; embedded field
            // names stay significant.
            5u8.hash(hasher);
            map.len().hash(hasher);
            for (key, item) in map {
                key.hash(hasher);
                hash_value(item, collator, hasher);
            }
        }
    }
}

/// MurmurHash3 x86 32-bit. Local implementation: the routing hash has to be
/// deterministic across processes and platforms.
pub(crate) fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in chunks.by_ref() {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, byte) in tail.iter().enumerate() {
            k |= u32::from(*byte) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}

/// Updates a CRUD op's routing hash and capped-collection mark.
///
/// On doc-locking engines the `_id` is mixed into the hash so a hot
/// collection still spreads across workers. Capped collections are exempt:
/// they must preserve insertion order, which needs a single writer.
fn process_crud_op(
    ctx: &ApplyContext,
    op: &OpHandle,
    hash: &mut u32,
    coll_properties: &mut CachedCollectionProperties,
) {
    let supports_doc_locking = ctx.engine().supports_doc_locking();
    let props = coll_properties.get(ctx, &op.ns);

    if supports_doc_locking && !props.is_capped {
        let id_hash = collator_aware_id_hash(op.id_element(), props.collator.as_ref());
        *hash = murmur3_x86_32(&id_hash.to_le_bytes(), *hash);
    }

    if op.op_type == OpType::Insert && props.is_capped {
        // Marked before routing so no worker ever bulk-inserts these.
        op.set_for_capped_collection(true);
    }
}

fn add_to_writer_vector(op: &OpHandle, writer_vectors: &mut [WriterVector], hash: u32) {
    let writer = &mut writer_vectors[hash as usize % writer_vectors.len()];
    if writer.is_empty() {
        writer.reserve(8); // Skip a few growth rounds
    }
    writer.push(Arc::clone(op));
}

/// Routes a batch of derived ops. Derived ops never carry session updates or
/// nested transactions, so this is hash-and-append only.
fn add_derived_ops(
    ctx: &ApplyContext,
    derived: &[OpHandle],
    writer_vectors: &mut [WriterVector],
    coll_properties: &mut CachedCollectionProperties,
) {
    for op in derived {
        let mut hash = namespace_hash(&op.ns);
        if op.is_crud() {
            process_crud_op(ctx, op, &mut hash, coll_properties);
        }
        add_to_writer_vector(op, writer_vectors, hash);
    }
}

/// Per-session buffers of partial-transaction entries, held until the
/// transaction commits, prepares-and-commits, or aborts.
#[derive(Default)]
pub(crate) struct TransactionAssembler {
    partial_txn_ops: HashMap<SessionId, Vec<OpHandle>>,
}

impl TransactionAssembler {
    fn session_of(op: &OpHandle) -> Result<SessionId, ApplierError> {
        op.session_id.ok_or_else(|| {
            ApplierError::InvalidEntry(format!(
                "transaction oplog entry without a session id: {}",
                op.redacted()
            ))
        })
    }

    /// Buffer one partial entry. A non-empty buffer must belong to the same
    /// transaction number as the incoming entry.
    fn append_partial(&mut self, op: &OpHandle) -> Result<(), ApplierError> {
        let session_id = Self::session_of(op)?;
        let partial_txn_list = self.partial_txn_ops.entry(session_id).or_default();
        if let Some(front) = partial_txn_list.first()
            && front.txn_number != op.txn_number
        {
            return Err(ApplierError::InvalidEntry(format!(
                "transaction {:?} on session {session_id} interleaves with \
                 unfinished transaction {:?}",
                op.txn_number, front.txn_number
            )));
        }
        partial_txn_list.push(Arc::clone(op));
        Ok(())
    }

    fn clear(&mut self, op: &OpHandle) -> Result<(), ApplierError> {
        let session_id = Self::session_of(op)?;
        self.partial_txn_ops.remove(&session_id);
        Ok(())
    }

    fn take(&mut self, op: &OpHandle) -> Result<Vec<OpHandle>, ApplierError> {
        let session_id = Self::session_of(op)?;
        Ok(self.partial_txn_ops.remove(&session_id).unwrap_or_default())
    }
}

impl OplogApplier {
    /// Partition `ops` into `writer_vectors`, decomposing transactions and
    /// deriving session-table writes into `derived_ops`.
    ///
    /// Only the capped-collection mark on input ops is ever mutated; the
    /// batch itself keeps its order and content. Output is deterministic for
    /// a given batch, worker count and catalog state.
    pub fn fill_writer_vectors(
        &self,
        ctx: &ApplyContext,
        ops: &[OpHandle],
        writer_vectors: &mut [WriterVector],
        derived_ops: &mut DerivedOpsPool,
    ) -> Result<(), ApplierError> {
        self.observer().on_batch_begin(ops);

        let mut session_tracker = SessionUpdateTracker::default();
        self.derive_ops_and_fill(ctx, ops, writer_vectors, derived_ops, Some(&mut session_tracker))?;

        // Residual session-table writes route through a second pass. The
        // tracker stays out of it: its own output must not feed back in.
        let residual = session_tracker.flush_all();
        if !residual.is_empty() {
            let handles = derived_ops.add(residual);
            self.derive_ops_and_fill(ctx, &handles, writer_vectors, derived_ops, None)?;
        }
        Ok(())
    }

    fn derive_ops_and_fill(
        &self,
        ctx: &ApplyContext,
        ops: &[OpHandle],
        writer_vectors: &mut [WriterVector],
        derived_ops: &mut DerivedOpsPool,
        mut session_tracker: Option<&mut SessionUpdateTracker>,
    ) -> Result<(), ApplierError> {
        let mut partial_txns = TransactionAssembler::default();
        let mut coll_properties = CachedCollectionProperties::default();

        for op in ops {
            // At or below the floor means already applied in a previous run.
            if op.op_time <= self.options().begin_applying_op_time {
                continue;
            }

            let mut hash = namespace_hash(&op.ns);

            // Every op type feeds the tracker; chunk-migration noops carry
            // session info too.
            if let Some(tracker) = session_tracker.as_deref_mut()
                && let Some(new_writes) = tracker.update_session(op)
            {
                let handles = derived_ops.add(new_writes);
                add_derived_ops(ctx, &handles, writer_vectors, &mut coll_properties);
            }

            // Entries of a still-open transaction wait for their terminal
            // entry; prepares wait the same way during initial sync. They may
            // not be durable in the local oplog yet, hence the buffer.
            if op.is_partial_transaction()
                || (op.should_prepare() && self.options().is_initial_sync())
            {
                partial_txns.append_partial(op)?;
                continue;
            }

            if op.command_type() == Some(CommandType::AbortTransaction) {
                partial_txns.clear(op)?;
            }

            if op.is_crud() {
                process_crud_op(ctx, op, &mut hash, &mut coll_properties);
            }

            if op.is_terminal_apply_ops() {
                if op.session_id.is_some() && op.txn_number.is_some() {
                    // Unprepared commit: the transaction's ops come from the
                    // oplog chain plus whatever this pass buffered.
                    let partial_txn_list = partial_txns.take(op)?;
                    let txn_ops = ctx
                        .engine()
                        .read_transaction_operations_from_oplog_chain(ctx, op, &partial_txn_list)?;
                    let handles = derived_ops.add(txn_ops);
                    add_derived_ops(ctx, &handles, writer_vectors, &mut coll_properties);
                } else {
                    // A nested or standalone applyOps carries its ops inline.
                    if op.prev_write_op_time_in_txn.is_some() {
                        return Err(ApplierError::InvalidEntry(format!(
                            "applyOps without a session links a previous optime: {}",
                            op.redacted()
                        )));
                    }
                    let extracted = extract_operations(op)?;
                    let handles = derived_ops.add(extracted);
                    add_derived_ops(ctx, &handles, writer_vectors, &mut coll_properties);
                }
                continue;
            }

            // A prepared transaction's commit materializes here only during
            // initial sync; otherwise the transaction machinery applies it.
            if op.is_prepared_commit() && self.options().is_initial_sync() {
                let partial_txn_list = partial_txns.take(op)?;
                let txn_ops = ctx
                    .engine()
                    .read_transaction_operations_from_oplog_chain(ctx, op, &partial_txn_list)?;
                let handles = derived_ops.add(txn_ops);
                add_derived_ops(ctx, &handles, writer_vectors, &mut coll_properties);
                continue;
            }

            add_to_writer_vector(op, writer_vectors, hash);
        }
        Ok(())
    }
}
