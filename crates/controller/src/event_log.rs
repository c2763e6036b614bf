//! Durable append-only log of committed registry events.
//!
//! Records are a 4-byte big-endian length followed by the borsh-encoded
//! event.  The table is rebuilt by replaying the log at startup.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
};

use hamq_state::RegistryEvent;
use parking_lot::Mutex;
use tracing::*;

use crate::errors::ControllerError;

#[derive(Debug)]
pub struct EventLog {
    file: Mutex<File>,
}

impl EventLog {
    /// Opens (or creates) the log and replays every complete record.  A
    /// torn final record is dropped with a warning; everything before it
    /// is intact.
    pub fn open(path: &Path) -> Result<(Self, Vec<RegistryEvent>), ControllerError> {
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut events = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= raw.len() {
            let len = u32::from_be_bytes(raw[pos..pos + 4].try_into().expect("event log: len"))
                as usize;
            if pos + 4 + len > raw.len() {
                warn!(%pos, "dropping torn record at end of event log");
                break;
            }
            let body = &raw[pos + 4..pos + 4 + len];
            let event = borsh::from_slice::<RegistryEvent>(body)
                .map_err(|_| ControllerError::CorruptEvent(pos as u64))?;
            events.push(event);
            pos += 4 + len;
        }

        debug!(count = events.len(), "replayed registry events");
        Ok((
            Self {
                file: Mutex::new(file),
            },
            events,
        ))
    }

    /// Durably appends one event.  Returns only after the record is synced.
    pub fn append(&self, event: &RegistryEvent) -> Result<(), ControllerError> {
        let body = borsh::to_vec(event).expect("event log: serialize");
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        let mut file = self.file.lock();
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn ev(epoch: u32) -> RegistryEvent {
        RegistryEvent::MasterElected {
            broker_name: "b".into(),
            new_master_address: "a:9000".into(),
            master_epoch: epoch,
            sync_state_set: BTreeSet::from(["a:9000".to_string()]),
            sync_state_set_epoch: epoch,
            new_master_elected: true,
        }
    }

    #[test]
    fn test_append_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");

        {
            let (log, replayed) = EventLog::open(&path).unwrap();
            assert!(replayed.is_empty());
            log.append(&ev(1)).unwrap();
            log.append(&ev(2)).unwrap();
        }

        let (_, replayed) = EventLog::open(&path).unwrap();
        assert_eq!(replayed, vec![ev(1), ev(2)]);
    }

    #[test]
    fn test_torn_tail_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");

        {
            let (log, _) = EventLog::open(&path).unwrap();
            log.append(&ev(1)).unwrap();
        }
        // Simulate a crash mid-write of the next record.
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[0, 0, 0, 40, 1, 2]);
        std::fs::write(&path, raw).unwrap();

        let (_, replayed) = EventLog::open(&path).unwrap();
        assert_eq!(replayed, vec![ev(1)]);
    }
}
