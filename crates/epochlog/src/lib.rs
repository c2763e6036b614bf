//! Epoch-indexed view of the commit log.
//!
//! Each master term gets one entry recording where in the log the term
//! begins.  Two replicas compare these records to find the last offset at
//! which their logs are byte-identical, which is what bounds truncation
//! when a slave re-attaches after a failover.

pub mod cache;
pub mod errors;
pub mod file;

pub use cache::{EpochCache, EpochEntry};
pub use errors::EpochLogError;

pub type EpochLogResult<T> = Result<T, EpochLogError>;
