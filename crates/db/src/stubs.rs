//! In-memory commit log used by endpoint and state-machine tests.

use parking_lot::Mutex;

use crate::{errors::DbError, traits::CommitLog, DbResult};

#[derive(Debug, Default)]
struct StubInner {
    base_offset: i64,
    data: Vec<u8>,
    /// Bytes at the tail that the self-check should discard, simulating a
    /// torn write from an unclean shutdown.
    dirty_tail: usize,
}

/// Commit log backed by one `Vec<u8>`.  Offsets are absolute; the vec
/// holds `[base_offset, base_offset + len)`.
#[derive(Debug, Default)]
pub struct StubCommitLog {
    inner: Mutex<StubInner>,
}

impl StubCommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log that already holds `data` starting at offset 0.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(StubInner {
                base_offset: 0,
                data,
                dirty_tail: 0,
            }),
        }
    }

    /// Marks the last `len` bytes as torn so `truncate_invalid_tail` has
    /// something to repair.
    pub fn inject_dirty_tail(&self, len: usize) {
        let mut inner = self.inner.lock();
        let len = len.min(inner.data.len());
        inner.dirty_tail = len;
    }

    /// Retires everything before `offset`, advancing the min offset the
    /// way file deletion would on a real store.
    pub fn discard_before(&self, offset: i64) {
        let mut inner = self.inner.lock();
        if offset <= inner.base_offset {
            return;
        }
        let cut = ((offset - inner.base_offset) as usize).min(inner.data.len());
        inner.data.drain(..cut);
        inner.base_offset = offset;
    }

    /// Raw copy of the stored bytes, for equality assertions.
    pub fn snapshot(&self) -> (i64, Vec<u8>) {
        let inner = self.inner.lock();
        (inner.base_offset, inner.data.clone())
    }
}

impl CommitLog for StubCommitLog {
    fn min_offset(&self) -> DbResult<i64> {
        Ok(self.inner.lock().base_offset)
    }

    fn max_phy_offset(&self) -> DbResult<i64> {
        let inner = self.inner.lock();
        Ok(inner.base_offset + inner.data.len() as i64)
    }

    fn append_to_commit_log(&self, start_offset: i64, data: &[u8]) -> DbResult<bool> {
        let mut inner = self.inner.lock();
        let tail = inner.base_offset + inner.data.len() as i64;
        if start_offset != tail {
            return Ok(false);
        }
        inner.data.extend_from_slice(data);
        Ok(true)
    }

    fn truncate_files(&self, offset: i64) -> DbResult<bool> {
        let mut inner = self.inner.lock();
        if offset < inner.base_offset {
            return Ok(false);
        }
        let keep = ((offset - inner.base_offset) as usize).min(inner.data.len());
        inner.data.truncate(keep);
        inner.dirty_tail = inner.dirty_tail.min(inner.data.len());
        Ok(true)
    }

    fn get_commit_log_data(&self, offset: i64, max_bytes: usize) -> DbResult<Vec<u8>> {
        let inner = self.inner.lock();
        let tail = inner.base_offset + inner.data.len() as i64;
        if offset < inner.base_offset || offset > tail {
            return Err(DbError::OffsetOutOfRange(offset, inner.base_offset, tail));
        }
        let start = (offset - inner.base_offset) as usize;
        let end = (start + max_bytes).min(inner.data.len());
        Ok(inner.data[start..end].to_vec())
    }

    fn reset_to_offset(&self, offset: i64) -> DbResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.data.is_empty() {
            return Ok(false);
        }
        inner.base_offset = offset;
        Ok(true)
    }

    fn truncate_invalid_tail(&self) -> DbResult<i64> {
        let mut inner = self.inner.lock();
        let keep = inner.data.len() - inner.dirty_tail;
        inner.data.truncate(keep);
        inner.dirty_tail = 0;
        Ok(inner.base_offset + inner.data.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let log = StubCommitLog::new();
        assert!(log.append_to_commit_log(0, b"hello").unwrap());
        assert!(log.append_to_commit_log(5, b" world").unwrap());
        // Gap and rewind both refuse.
        assert!(!log.append_to_commit_log(20, b"x").unwrap());
        assert!(!log.append_to_commit_log(3, b"x").unwrap());

        assert_eq!(log.max_phy_offset().unwrap(), 11);
        assert_eq!(log.get_commit_log_data(5, 100).unwrap(), b" world");
    }

    #[test]
    fn test_truncate_and_dirty_tail() {
        let log = StubCommitLog::with_data(b"0123456789".to_vec());
        assert!(log.truncate_files(7).unwrap());
        assert_eq!(log.max_phy_offset().unwrap(), 7);

        log.inject_dirty_tail(3);
        assert_eq!(log.truncate_invalid_tail().unwrap(), 4);
    }

    #[test]
    fn test_discard_before() {
        let log = StubCommitLog::with_data(b"0123456789".to_vec());
        log.discard_before(4);
        assert_eq!(log.min_offset().unwrap(), 4);
        assert_eq!(log.max_phy_offset().unwrap(), 10);
        assert_eq!(log.get_commit_log_data(4, 2).unwrap(), b"45");
        assert!(log.get_commit_log_data(0, 2).is_err());
    }
}
