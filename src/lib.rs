//! Parallel oplog application core for a replicated document database's
//! secondary nodes.
//!
//! The surrounding replication machinery drains ordered batches of oplog
//! entries from the sync source and hands them here. One partitioning pass
//! ([`OplogApplier::fill_writer_vectors`]) splits a batch into per-worker
//! vectors such that ops that must serialize (same document, same capped
//! collection, or any same collection on an engine without document-level
//! locking) share a vector, while independent ops spread across workers.
//! Multi-entry transactions and grouped applyOps decompose into their
//! constituent CRUD ops during the pass.
//!
//! Each worker then applies its vector through [`multi_sync_apply`], which
//! sorts by namespace, coalesces insert runs into bulk writes and applies
//! everything else one op at a time through [`sync_apply`], retrying write
//! conflicts and suppressing the idempotency errors its apply mode permits.
//!
//! The storage engine itself (catalog, locks, CRUD and command execution)
//! sits behind the [`engine::StorageEngine`] trait.

pub mod apply;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod failpoint;
pub mod metrics;
pub mod multikey;
pub mod oplog;

pub use apply::sync_apply::sync_apply;
pub use apply::worker::{multi_sync_apply, stable_sort_by_namespace};
pub use apply::{DerivedOpsPool, OplogApplier, WriterVector};
pub use config::{ApplierConfig, ApplyMode};
pub use context::{ApplyContext, write_conflict_retry};
pub use error::{ApplierError, ApplierErrorCode};
pub use metrics::{ApplierMetrics, ApplierMetricsSnapshot, ApplierObserver, NullObserver};
pub use multikey::MultikeyPathInfo;
pub use oplog::{OpHandle, OpTime, OplogEntry, OplogEntryBatch, OpType, SessionId};
