use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("unknown connection state {0} on the wire")]
    BadState(u32),

    #[error("malformed frame: {0}")]
    BadFrame(&'static str),

    #[error("local tail {local} does not match streamed offset {master}")]
    OffsetMismatch { local: i64, master: i64 },

    #[error("store refused truncation to {0}")]
    TruncateRefused(i64),

    #[error("store: {0}")]
    Db(#[from] hamq_db::errors::DbError),

    #[error("epoch log: {0}")]
    EpochLog(#[from] hamq_epochlog::EpochLogError),

    #[error("connection closed by peer")]
    Closed,
}
