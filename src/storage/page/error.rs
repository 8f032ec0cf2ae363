use thiserror::Error;

use crate::common::types::Rid;

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Insufficient space in page")]
    InsufficientSpace,

    #[error("Invalid slot for rid {0:?}")]
    InvalidSlot(Rid),

    #[error("Tuple at {0:?} is deleted")]
    TupleDeleted(Rid),

    #[error("Tuple at {0:?} is not marked deleted")]
    TupleNotDeleted(Rid),

    #[error("Record name too long: {0}")]
    NameTooLong(String),

    #[error("Record {0} not found")]
    RecordNotFound(String),

    #[error("Record {0} already exists")]
    RecordExists(String),
}

/// Result type for page-level operations
pub type Result<T> = std::result::Result<T, PageError>;
