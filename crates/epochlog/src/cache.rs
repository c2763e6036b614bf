//! In-memory epoch table with optional file backing.

use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::*;

use crate::{errors::EpochLogError, file, EpochLogResult};

/// Marks where a master term begins in the commit log.  The end of the
/// range is implicit: the start of the next entry, or the tracked log tail
/// for the live entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EpochEntry {
    pub epoch: u32,
    pub start_offset: i64,
}

impl EpochEntry {
    pub fn new(epoch: u32, start_offset: i64) -> Self {
        Self {
            epoch,
            start_offset,
        }
    }
}

#[derive(Debug)]
struct CacheInner {
    /// Strictly increasing in both epoch and start offset.
    entries: Vec<EpochEntry>,

    /// End offset of the live (newest) entry, normally the local log tail.
    last_end_offset: i64,
}

impl CacheInner {
    fn end_offset_at(&self, idx: usize) -> i64 {
        if idx + 1 < self.entries.len() {
            self.entries[idx + 1].start_offset
        } else {
            self.last_end_offset.max(self.entries[idx].start_offset)
        }
    }

    fn find_idx_by_epoch(&self, epoch: u32) -> Option<usize> {
        self.entries.iter().position(|e| e.epoch == epoch)
    }
}

/// Ordered record of `(epoch, start_offset)` entries for one replica's
/// commit log.  Readers may overlap; mutation is serialized and rewrites
/// the backing file when one is configured.
#[derive(Debug)]
pub struct EpochCache {
    path: Option<PathBuf>,
    inner: RwLock<CacheInner>,
}

impl EpochCache {
    /// Creates an empty cache with no file backing.  Used for the remote
    /// side of a handshake and in tests.
    pub fn new_in_memory() -> Self {
        Self {
            path: None,
            inner: RwLock::new(CacheInner {
                entries: Vec::new(),
                last_end_offset: 0,
            }),
        }
    }

    /// Builds an unbacked cache from already-ordered entries, e.g. the
    /// epoch list a master pushes during handshake.
    pub fn from_entries(entries: Vec<EpochEntry>, last_end_offset: i64) -> Self {
        Self {
            path: None,
            inner: RwLock::new(CacheInner {
                entries,
                last_end_offset,
            }),
        }
    }

    /// Opens a file-backed cache, loading any existing records.
    pub fn open(path: PathBuf) -> EpochLogResult<Self> {
        let (entries, last_end_offset) = file::load(&path)?;
        for w in entries.windows(2) {
            if w[1].epoch <= w[0].epoch || w[1].start_offset < w[0].start_offset {
                return Err(EpochLogError::OutOfOrderRecord(1));
            }
        }
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(CacheInner {
                entries,
                last_end_offset,
            }),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn entries(&self) -> Vec<EpochEntry> {
        self.inner.read().entries.clone()
    }

    pub fn first_entry(&self) -> Option<EpochEntry> {
        self.inner.read().entries.first().copied()
    }

    pub fn last_entry(&self) -> Option<EpochEntry> {
        self.inner.read().entries.last().copied()
    }

    pub fn find_entry_by_epoch(&self, epoch: u32) -> Option<EpochEntry> {
        let inner = self.inner.read();
        inner.find_idx_by_epoch(epoch).map(|i| inner.entries[i])
    }

    /// Entry whose range contains `offset`.  Offsets past the live entry's
    /// tracked end still belong to the live entry.
    pub fn entry_of_offset(&self, offset: i64) -> Option<EpochEntry> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .rev()
            .find(|e| offset >= e.start_offset)
            .copied()
    }

    /// Entry immediately following the given epoch, if any.
    pub fn next_entry(&self, epoch: u32) -> Option<EpochEntry> {
        let inner = self.inner.read();
        let idx = inner.find_idx_by_epoch(epoch)?;
        inner.entries.get(idx + 1).copied()
    }

    /// End offset of the given epoch's range, if the epoch is present.
    pub fn end_offset_by_epoch(&self, epoch: u32) -> Option<i64> {
        let inner = self.inner.read();
        inner.find_idx_by_epoch(epoch).map(|i| inner.end_offset_at(i))
    }

    pub fn last_end_offset(&self) -> i64 {
        self.inner.read().last_end_offset
    }

    /// Advances the live entry's end offset.  Memory-only; callers that
    /// need it on disk follow up with [`Self::flush`].
    pub fn set_last_end_offset(&self, offset: i64) {
        let mut inner = self.inner.write();
        if offset > inner.last_end_offset {
            inner.last_end_offset = offset;
        }
    }

    /// Appends a new-term entry.  Returns `Ok(false)` without mutating if
    /// the entry would break epoch or offset monotonicity.
    pub fn append_entry(&self, entry: EpochEntry) -> EpochLogResult<bool> {
        let mut inner = self.inner.write();
        if let Some(last) = inner.entries.last() {
            if entry.epoch <= last.epoch || entry.start_offset < last.start_offset {
                warn!(
                    epoch = %entry.epoch,
                    start_offset = %entry.start_offset,
                    last_epoch = %last.epoch,
                    "rejecting non-monotonic epoch entry"
                );
                return Ok(false);
            }
        }

        info!(epoch = %entry.epoch, start_offset = %entry.start_offset, "appending epoch entry");
        inner.entries.push(entry);
        if inner.last_end_offset < entry.start_offset {
            inner.last_end_offset = entry.start_offset;
        }
        self.persist(&inner)?;
        Ok(true)
    }

    /// Drops entries whose range lies entirely at or beyond `offset` and
    /// pins the live end offset to `offset`.  Applying the same truncation
    /// twice is a no-op.
    pub fn truncate_suffix_from_offset(&self, offset: i64) -> EpochLogResult<()> {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.start_offset < offset);
        inner.last_end_offset = offset;
        if inner.entries.len() != before {
            info!(
                %offset,
                dropped = before - inner.entries.len(),
                "truncated epoch suffix"
            );
        }
        self.persist(&inner)
    }

    /// Drops entries that end at or before `offset` and clamps the oldest
    /// surviving entry's start to `offset`.  Mirrors commit-log head
    /// retirement.
    pub fn truncate_prefix_before_offset(&self, offset: i64) -> EpochLogResult<()> {
        let mut inner = self.inner.write();
        loop {
            if inner.entries.len() <= 1 {
                break;
            }
            // First entry's end is the second entry's start.
            if inner.entries[1].start_offset <= offset {
                inner.entries.remove(0);
            } else {
                break;
            }
        }
        if let Some(first) = inner.entries.first_mut() {
            if first.start_offset < offset {
                first.start_offset = offset;
            }
        }
        self.persist(&inner)
    }

    /// Finds the largest offset at which this cache's log and `remote`'s
    /// log are byte-identical: the end of the newest epoch both sides hold
    /// with the same start offset, capped by whichever side's copy of that
    /// epoch is shorter.  Returns `-1` when the histories share nothing.
    pub fn find_consistent_point(&self, remote: &EpochCache) -> i64 {
        let local = self.inner.read();
        let rem = remote.inner.read();

        for (idx, entry) in local.entries.iter().enumerate().rev() {
            let Some(rem_idx) = rem.find_idx_by_epoch(entry.epoch) else {
                continue;
            };
            // Same epoch number with a different start means the terms are
            // not actually the same history.
            if rem.entries[rem_idx].start_offset != entry.start_offset {
                continue;
            }
            return local.end_offset_at(idx).min(rem.end_offset_at(rem_idx));
        }
        -1
    }

    /// Rewrites the backing file from the current in-memory state.
    pub fn flush(&self) -> EpochLogResult<()> {
        let inner = self.inner.read();
        self.persist(&inner)
    }

    fn persist(&self, inner: &CacheInner) -> EpochLogResult<()> {
        if let Some(path) = &self.path {
            file::store(path, &inner.entries, inner.last_end_offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_of(entries: &[(u32, i64)], last_end: i64) -> EpochCache {
        let entries = entries
            .iter()
            .map(|(e, s)| EpochEntry::new(*e, *s))
            .collect();
        EpochCache::from_entries(entries, last_end)
    }

    #[test]
    fn test_append_monotonic() {
        let cache = EpochCache::new_in_memory();
        assert!(cache.append_entry(EpochEntry::new(1, 0)).unwrap());
        assert!(cache.append_entry(EpochEntry::new(2, 1570)).unwrap());

        // Same epoch, older epoch, and regressing start offset all bounce.
        assert!(!cache.append_entry(EpochEntry::new(2, 3000)).unwrap());
        assert!(!cache.append_entry(EpochEntry::new(1, 3000)).unwrap());
        assert!(!cache.append_entry(EpochEntry::new(3, 100)).unwrap());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.last_entry().unwrap(), EpochEntry::new(2, 1570));
    }

    #[test]
    fn test_end_offsets() {
        let cache = cache_of(&[(1, 0), (2, 1570)], 3140);
        assert_eq!(cache.end_offset_by_epoch(1), Some(1570));
        assert_eq!(cache.end_offset_by_epoch(2), Some(3140));
        assert_eq!(cache.end_offset_by_epoch(3), None);
    }

    #[test]
    fn test_entry_of_offset() {
        let cache = cache_of(&[(1, 0), (2, 1570)], 3140);
        assert_eq!(cache.entry_of_offset(0).unwrap().epoch, 1);
        assert_eq!(cache.entry_of_offset(1569).unwrap().epoch, 1);
        assert_eq!(cache.entry_of_offset(1570).unwrap().epoch, 2);
        // Past the tracked tail still maps to the live entry.
        assert_eq!(cache.entry_of_offset(9999).unwrap().epoch, 2);
    }

    #[test]
    fn test_consistent_point_slave_behind() {
        // Master has moved to epoch 2, slave only ever saw epoch 1 and
        // stopped exactly at its end.
        let master = cache_of(&[(1, 0), (2, 1570)], 3140);
        let slave = cache_of(&[(1, 0)], 1570);
        assert_eq!(slave.find_consistent_point(&master), 1570);
        assert_eq!(master.find_consistent_point(&slave), 1570);
    }

    #[test]
    fn test_consistent_point_shared_live_epoch() {
        let master = cache_of(&[(1, 0), (2, 1570)], 3140);
        let slave = cache_of(&[(1, 0), (2, 1570)], 2000);
        assert_eq!(slave.find_consistent_point(&master), 2000);
    }

    #[test]
    fn test_consistent_point_divergent_suffix() {
        // New master was elected at 1570 (epoch 3); old slave wrote some of
        // the dead epoch 2.  Only epoch 1 is shared history.
        let new_master = cache_of(&[(1, 0), (3, 1570)], 4000);
        let old_slave = cache_of(&[(1, 0), (2, 1570)], 2500);
        assert_eq!(old_slave.find_consistent_point(&new_master), 1570);
    }

    #[test]
    fn test_consistent_point_same_epoch_different_start() {
        // Epoch 2 exists on both sides but starts elsewhere, so it does not
        // count as common history; epoch 1 does.
        let a = cache_of(&[(1, 0), (2, 1570)], 3140);
        let b = cache_of(&[(1, 0), (2, 1800)], 3000);
        assert_eq!(a.find_consistent_point(&b), 1570);
    }

    #[test]
    fn test_consistent_point_nothing_shared() {
        let a = cache_of(&[(2, 100)], 500);
        let b = cache_of(&[(1, 0)], 400);
        assert_eq!(a.find_consistent_point(&b), -1);
        assert_eq!(b.find_consistent_point(&a), -1);
    }

    #[test]
    fn test_truncate_suffix() {
        let cache = cache_of(&[(1, 0), (2, 1570), (3, 2400)], 3000);
        cache.truncate_suffix_from_offset(1570).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(1, 0)]);
        assert_eq!(cache.last_end_offset(), 1570);
    }

    #[test]
    fn test_truncate_suffix_idempotent() {
        let cache = cache_of(&[(1, 0), (2, 1570), (3, 2400)], 3000);
        cache.truncate_suffix_from_offset(2000).unwrap();
        let entries = cache.entries();
        let end = cache.last_end_offset();
        cache.truncate_suffix_from_offset(2000).unwrap();
        assert_eq!(cache.entries(), entries);
        assert_eq!(cache.last_end_offset(), end);
    }

    #[test]
    fn test_truncate_prefix() {
        let cache = cache_of(&[(1, 0), (2, 1570), (3, 2400)], 3000);
        cache.truncate_prefix_before_offset(1600).unwrap();
        assert_eq!(
            cache.entries(),
            vec![EpochEntry::new(2, 1600), EpochEntry::new(3, 2400)]
        );
    }

    #[test]
    fn test_consistent_point_random_shared_prefix() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            // Build a shared history, then let each side diverge after a
            // random fork point.
            let shared_len = rng.gen_range(1..6usize);
            let mut offset = 0i64;
            let mut shared = Vec::new();
            for i in 0..shared_len {
                shared.push((i as u32 + 1, offset));
                offset += rng.gen_range(1..2000i64);
            }
            let fork = offset;

            let mut a_entries = shared.clone();
            let mut b_entries = shared.clone();
            let mut a_end = fork + rng.gen_range(0..500i64);
            let mut b_end = fork + rng.gen_range(0..500i64);
            if rng.gen_bool(0.5) {
                a_entries.push((shared_len as u32 + 1, a_end));
                a_end += rng.gen_range(1..500i64);
            }
            if rng.gen_bool(0.5) {
                b_entries.push((shared_len as u32 + 5, b_end));
                b_end += rng.gen_range(1..500i64);
            }

            let a = cache_of(&a_entries, a_end);
            let b = cache_of(&b_entries, b_end);
            let p = a.find_consistent_point(&b);

            // The last shared epoch bounds the consistent point from both
            // sides.
            let last_shared = shared_len as u32;
            let expect = a
                .end_offset_by_epoch(last_shared)
                .unwrap()
                .min(b.end_offset_by_epoch(last_shared).unwrap());
            assert_eq!(p, expect);
            assert!(p >= shared.last().unwrap().1);
        }
    }

    #[test]
    fn test_truncate_prefix_keeps_live_entry() {
        let cache = cache_of(&[(1, 0), (2, 1570)], 3000);
        cache.truncate_prefix_before_offset(5000).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(2, 5000)]);
    }
}
