use basalt::StorageError;
use thiserror::Error;

/// System-layer error taxonomy, wrapping the kernel's.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("index already exists on {table} ({})", cols.join(", "))]
    IndexExists { table: String, cols: Vec<String> },

    #[error("index not found on {table} ({})", cols.join(", "))]
    IndexNotFound { table: String, cols: Vec<String> },

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("incompatible types: expected {expected}, got {got}")]
    IncompatibleType { expected: String, got: String },

    #[error("duplicate key in index {0}")]
    DuplicateKey(String),

    #[error("transaction aborted")]
    TransactionAborted,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type DbResult<T> = Result<T, DbError>;
