//! Store-level failure modes. These are translated into `TrackerError` by
//! `tracker-domain`, which is the only crate that knows what a given
//! not-found or already-exists condition *means* for a particular operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: redb::DatabaseError,
    },

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("failed to encode row: {0}")]
    Encode(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
