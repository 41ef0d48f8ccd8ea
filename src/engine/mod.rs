//! Storage-engine surface the applier runs against. The engine owns the
//! catalog, the lock manager and the CRUD/command execution paths; the
//! applier only drives them.

use crate::config::ApplyMode;
use crate::context::ApplyContext;
use crate::error::ApplierError;
use crate::oplog::{OpHandle, OplogEntry, OplogEntryBatch};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Exclusive,
}

/// Held database lock. Dropping the guard releases it.
pub trait DatabaseLock: Send {}

/// Default collation of a collection. Affects `_id` equality, and therefore
/// the routing hash: two `_id`s the collator considers equal must land on the
/// same worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    pub case_insensitive: bool,
}

impl Collation {
    pub fn case_insensitive(locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            case_insensitive: true,
        }
    }

    /// The string form fed to the hasher in place of the raw string.
    pub fn comparison_key(&self, s: &str) -> String {
        if self.case_insensitive {
            s.to_lowercase()
        } else {
            s.to_owned()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionInfo {
    pub is_capped: bool,
    pub collator: Option<Collation>,
}

/// Collection locator used when acquiring locks: by UUID when the op carries
/// one (stable across renames), by namespace otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceOrUuid {
    Namespace(String),
    Uuid { db: String, uuid: Uuid },
}

impl NamespaceOrUuid {
    pub fn db_name(&self) -> &str {
        match self {
            NamespaceOrUuid::Namespace(ns) => {
                ns.split_once('.').map_or(ns.as_str(), |(db, _)| db)
            }
            NamespaceOrUuid::Uuid { db, .. } => db,
        }
    }
}

/// Resolve the namespace an entry targets. Entries carrying a collection UUID
/// resolve through the live catalog so that renames between the primary's
/// write and our apply land on the current name.
pub fn resolve_namespace(
    engine: &dyn StorageEngine,
    entry: &OplogEntry,
) -> Result<String, ApplierError> {
    match entry.uuid {
        Some(uuid) => engine.lookup_namespace_by_uuid(&uuid).ok_or_else(|| {
            ApplierError::NamespaceNotFound(format!("no namespace with UUID {uuid}"))
        }),
        None => Ok(entry.ns.clone()),
    }
}

/// The locator to lock for this entry: `(db, uuid)` when a UUID is present,
/// the resolved namespace otherwise.
pub fn namespace_or_uuid(ns: &str, entry: &OplogEntry) -> NamespaceOrUuid {
    match entry.uuid {
        Some(uuid) => NamespaceOrUuid::Uuid {
            db: ns.split_once('.').map_or(ns, |(db, _)| db).to_owned(),
            uuid,
        },
        None => NamespaceOrUuid::Namespace(ns.to_owned()),
    }
}

/// Writes to `system.views` invalidate the view catalog, which requires the
/// stronger lock.
pub fn fix_lock_mode_for_system_views(ns: &str, mode: LockMode) -> LockMode {
    if ns.ends_with(".system.views") {
        LockMode::Exclusive
    } else {
        mode
    }
}

/// Process-wide storage engine handle. Every method that reads catalog state
/// (`database_exists`, `collection_info`) expects the caller to hold an
/// appropriate database lock.
pub trait StorageEngine: Send + Sync {
    /// Whether concurrent writes to distinct documents of one collection are
    /// allowed. Engines without it serialize whole collections, which the
    /// routing hash must respect.
    fn supports_doc_locking(&self) -> bool;

    fn lookup_namespace_by_uuid(&self, uuid: &Uuid) -> Option<String>;

    fn lock_database(&self, db: &str, mode: LockMode) -> Box<dyn DatabaseLock>;

    fn database_exists(&self, db: &str) -> bool;

    fn collection_info(&self, ns: &str) -> Option<CollectionInfo>;

    /// Apply one CRUD op, or a grouped run of inserts, to the collection the
    /// batch addresses. Invokes `on_applied` once per successfully applied
    /// op. Write conflicts surface as `ApplierErrorCode::WriteConflict` and
    /// are retried by the caller.
    fn apply_operation(
        &self,
        ctx: &ApplyContext,
        locator: &NamespaceOrUuid,
        batch: OplogEntryBatch<'_>,
        should_always_upsert: bool,
        mode: ApplyMode,
        on_applied: &(dyn Fn() + Sync),
    ) -> Result<(), ApplierError>;

    /// Apply a command op. Commands manage their own locks and must not
    /// implicitly create databases.
    fn apply_command(
        &self,
        ctx: &ApplyContext,
        entry: &OplogEntry,
        mode: ApplyMode,
    ) -> Result<(), ApplierError>;

    /// Walk the oplog chain ending at `terminal` together with the buffered
    /// partial entries and return the transaction's flat operation list in
    /// chain order.
    fn read_transaction_operations_from_oplog_chain(
        &self,
        ctx: &ApplyContext,
        terminal: &OplogEntry,
        partial: &[OpHandle],
    ) -> Result<Vec<OplogEntry>, ApplierError>;
}
