use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("append at {0} does not continue the log (tail {1})")]
    NonContiguousAppend(i64, i64),

    #[error("offset {0} outside stored range {1}..{2}")]
    OffsetOutOfRange(i64, i64, i64),

    #[error("store io: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}
