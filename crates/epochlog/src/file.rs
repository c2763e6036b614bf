//! Fixed-record codec for the epoch file.
//!
//! The file is a run of 12-byte big-endian `(epoch: u32, start_offset:
//! i64)` records followed by one end marker record `(u32::MAX, live end
//! offset)` recording where the newest epoch's data stops.

use std::{
    fs,
    io::Write,
    path::Path,
};

use bytes::{Buf, BufMut, BytesMut};

use crate::{cache::EpochEntry, errors::EpochLogError, EpochLogResult};

pub const RECORD_SIZE: usize = 12;

/// Epoch value reserved for the end marker record.
const END_MARKER: u32 = u32::MAX;

/// Loads entries and the live end offset.  A missing file reads as empty.
pub fn load(path: &Path) -> EpochLogResult<(Vec<EpochEntry>, i64)> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    if raw.len() % RECORD_SIZE != 0 {
        return Err(EpochLogError::MalformedFile(raw.len() as u64));
    }

    let mut buf = &raw[..];
    let mut entries = Vec::with_capacity(raw.len() / RECORD_SIZE);
    let mut last_end_offset = 0i64;

    while buf.remaining() >= RECORD_SIZE {
        let epoch = buf.get_u32();
        let offset = buf.get_i64();
        if epoch == END_MARKER {
            last_end_offset = offset;
            break;
        }
        entries.push(EpochEntry::new(epoch, offset));
    }

    // A file written before any end marker (or torn right at it) just
    // falls back to the newest entry's start.
    if last_end_offset == 0 {
        if let Some(last) = entries.last() {
            last_end_offset = last.start_offset;
        }
    }

    Ok((entries, last_end_offset))
}

/// Rewrites the file from the full entry list.
pub fn store(path: &Path, entries: &[EpochEntry], last_end_offset: i64) -> EpochLogResult<()> {
    let mut buf = BytesMut::with_capacity((entries.len() + 1) * RECORD_SIZE);
    for entry in entries {
        buf.put_u32(entry.epoch);
        buf.put_i64(entry.start_offset);
    }
    buf.put_u32(END_MARKER);
    buf.put_i64(last_end_offset);

    let mut f = fs::File::create(path)?;
    f.write_all(&buf)?;
    f.sync_data()?;
    Ok(())
}
