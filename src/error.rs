use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierErrorCode {
    WriteConflict,
    NamespaceNotFound,
    UpdateOperationFailed,
    CommandFailed,
    InvalidEntry,
    OplogChainBroken,
}

impl ApplierErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplierErrorCode::WriteConflict => "write_conflict",
            ApplierErrorCode::NamespaceNotFound => "namespace_not_found",
            ApplierErrorCode::UpdateOperationFailed => "update_operation_failed",
            ApplierErrorCode::CommandFailed => "command_failed",
            ApplierErrorCode::InvalidEntry => "invalid_entry",
            ApplierErrorCode::OplogChainBroken => "oplog_chain_broken",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplierError {
    /// Storage-level optimistic concurrency failure. Consumed transparently
    /// by `write_conflict_retry`; never escapes a worker.
    #[error("write conflict on {0}")]
    WriteConflict(String),
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    /// An update targeted a document that does not exist.
    #[error("update operation failed: {0}")]
    UpdateOperationFailed(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("invalid oplog entry: {0}")]
    InvalidEntry(String),
    #[error("oplog chain broken: {0}")]
    OplogChainBroken(String),
    /// Context added on the way out while keeping the source's code intact.
    #[error("{context}: {source}")]
    Annotated {
        context: String,
        #[source]
        source: Box<ApplierError>,
    },
}

impl ApplierError {
    pub fn code(&self) -> ApplierErrorCode {
        match self {
            ApplierError::WriteConflict(_) => ApplierErrorCode::WriteConflict,
            ApplierError::NamespaceNotFound(_) => ApplierErrorCode::NamespaceNotFound,
            ApplierError::UpdateOperationFailed(_) => ApplierErrorCode::UpdateOperationFailed,
            ApplierError::CommandFailed(_) => ApplierErrorCode::CommandFailed,
            ApplierError::InvalidEntry(_) => ApplierErrorCode::InvalidEntry,
            ApplierError::OplogChainBroken(_) => ApplierErrorCode::OplogChainBroken,
            ApplierError::Annotated { source, .. } => source.code(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn annotate(self, context: impl Into<String>) -> ApplierError {
        ApplierError::Annotated {
            context: context.into(),
            source: Box::new(self),
        }
    }
}
