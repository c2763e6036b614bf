use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("event log io: {0}")]
    EventLogIo(#[from] io::Error),

    #[error("event log record {0} undecodable")]
    CorruptEvent(u64),
}
