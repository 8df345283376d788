use thiserror::Error;

/// Crate-wide error with a stable kind per failure class.
///
/// Transient IO is retried only inside idempotent reads (snapshots,
/// manifests); write and commit failures always surface to the caller,
/// whose retry decision is explicit.
#[derive(Debug, Error)]
pub enum Error {
    /// An unrecognized or malformed option. Fatal at construction.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A data-file schema can no longer be reconciled with the table schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The commit raced another writer but the pending changes are
    /// compatible; retry within the commit retry budget.
    #[error("retriable commit conflict: {0}")]
    ConflictRetriable(String),

    /// Two writers deleted the same file, or an overwrite collided.
    #[error("fatal commit conflict: {0}")]
    ConflictFatal(String),

    /// A filesystem error that may succeed on retry.
    #[error("transient io error: {0}")]
    IoTransient(#[source] std::io::Error),

    /// A file that must exist is missing, or its content is corrupt.
    #[error("io error: {0}")]
    IoFatal(String),

    /// The merge engine rejected a record (e.g. DELETE under partial-update
    /// without `partial-update.ignore-delete`).
    #[error("merge unsupported: {0}")]
    MergeUnsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl Error {
    /// True when the optimistic commit loop may retry after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::ConflictRetriable(_) | Error::IoTransient(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn kinds_carry_their_class() {
        assert!(Error::ConflictRetriable("raced".into()).is_retriable());
        assert!(!Error::ConflictFatal("double delete".into()).is_retriable());
        assert!(!Error::ConfigInvalid("bad key".into()).is_retriable());

        let wrapped: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(wrapped, Error::Io(_)));
    }
}
