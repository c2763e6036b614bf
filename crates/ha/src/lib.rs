//! Master↔slave replication endpoints.
//!
//! The master side accepts slave connections, pushes its epoch list during
//! handshake and then streams commit-log ranges.  The slave side connects
//! out, reconciles its log against the master's epoch history (truncating
//! any divergent suffix) and appends the streamed bytes, reporting its
//! offset back so the master can move the group's confirm offset.

pub mod client;
pub mod connection;
pub mod ctl;
pub mod errors;
pub mod service;
pub mod wire;

pub use ctl::ReplicationCtl;
pub use errors::HaError;
pub use service::{HaConfig, HaService};

pub type HaResult<T> = Result<T, HaError>;
