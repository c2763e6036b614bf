use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpochLogError {
    #[error("epoch file io: {0}")]
    Io(#[from] io::Error),

    #[error("epoch file length {0} is not a whole number of records")]
    MalformedFile(u64),

    #[error("epoch file record {0} out of order")]
    OutOfOrderRecord(usize),
}
