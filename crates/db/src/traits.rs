//! Trait definitions for the commit-log storage interface the replication
//! core drives.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::DbResult;

/// Append-only commit log, addressed by physical byte offset.
///
/// One instance is shared between the local write path and the replication
/// endpoints; which of the two appends is decided by the broker's role.
pub trait CommitLog: Send + Sync + 'static {
    /// Oldest offset still stored.  Data before this has been retired.
    fn min_offset(&self) -> DbResult<i64>;

    /// Offset one past the newest stored byte.
    fn max_phy_offset(&self) -> DbResult<i64>;

    /// Appends `data` at exactly `start_offset`.  Returns `Ok(false)` if
    /// the offset doesn't continue the log; the caller decides whether
    /// that's fatal.
    fn append_to_commit_log(&self, start_offset: i64, data: &[u8]) -> DbResult<bool>;

    /// Drops everything at and beyond `offset`.  Returns `Ok(false)` when
    /// the store cannot honor the request (offset below its min).
    fn truncate_files(&self, offset: i64) -> DbResult<bool>;

    /// Reads up to `max_bytes` starting at `offset`.
    fn get_commit_log_data(&self, offset: i64, max_bytes: usize) -> DbResult<Vec<u8>>;

    /// Re-bases an empty (or fully discarded) log so the next append lands
    /// at `offset`.  Used when a blank slave starts syncing mid-stream.
    fn reset_to_offset(&self, offset: i64) -> DbResult<bool>;

    /// Store self-check: drop any torn tail from an unclean shutdown and
    /// return the repaired max offset.
    fn truncate_invalid_tail(&self) -> DbResult<i64>;

    /// Wall-clock milliseconds, routed through the store so tests can pin
    /// time.
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("db: clock before epoch")
            .as_millis() as u64
    }
}
