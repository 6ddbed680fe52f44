use thiserror::Error;

use crate::PageNo;

/// Kernel error taxonomy.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {page_no} does not exist in file {fd}")]
    PageNotExist { fd: u32, page_no: PageNo },

    #[error("record not found at page {page_no} slot {slot_no}")]
    RecordNotFound { page_no: i32, slot_no: i32 },

    #[error("invalid record size {0}")]
    InvalidRecordSize(usize),

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("buffer pool exhausted, all frames pinned")]
    BufferPoolFull,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
