//! Fixed framing for the replication transport.  All integers big-endian.
//!
//! Slave → master: a 12-byte transfer header `[state: u32][max_offset:
//! i64]`, used both for the handshake request and for offset reports.  The
//! handshake request is followed by one length-prefixed identity blob
//! (`[len: u16][broker address utf-8]`) so the master can tie the
//! connection to an ISR member.
//!
//! Master → slave: a 28-byte data header `[state: u32][body_size: u32]
//! [master_offset: i64][master_epoch: u32][confirm_offset: i64]` before
//! every body.  The handshake reply's body is the master's entire epoch
//! list as consecutive 12-byte `(epoch, start_offset)` records, with
//! `master_offset` carrying the master's max offset.

use bytes::{Buf, BufMut, BytesMut};
use hamq_epochlog::EpochEntry;
use num_enum::TryFromPrimitive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{errors::HaError, HaResult};

pub const TRANSFER_HEADER_SIZE: usize = 12;
pub const DATA_HEADER_SIZE: usize = 28;
pub const EPOCH_RECORD_SIZE: usize = 12;

/// Where a replication channel is in its lifecycle.  Values travel on the
/// wire, so the discriminants are protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum HaConnectionState {
    Ready = 0,
    Handshake = 1,
    Transfer = 2,
    Suspend = 3,
    Shutdown = 4,
}

/// Slave-sent header: handshake request or offset report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransferHeader {
    pub state: HaConnectionState,
    pub max_offset: i64,
}

/// Master-sent header preceding every message body.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataHeader {
    pub state: HaConnectionState,
    pub body_size: u32,
    pub master_offset: i64,
    pub master_epoch: u32,
    pub confirm_offset: i64,
}

pub fn encode_transfer_header(hdr: &TransferHeader) -> [u8; TRANSFER_HEADER_SIZE] {
    let mut buf = [0u8; TRANSFER_HEADER_SIZE];
    buf[0..4].copy_from_slice(&(hdr.state as u32).to_be_bytes());
    buf[4..12].copy_from_slice(&hdr.max_offset.to_be_bytes());
    buf
}

pub fn decode_transfer_header(raw: &[u8; TRANSFER_HEADER_SIZE]) -> HaResult<TransferHeader> {
    let mut buf = &raw[..];
    let state_raw = buf.get_u32();
    let state =
        HaConnectionState::try_from(state_raw).map_err(|_| HaError::BadState(state_raw))?;
    Ok(TransferHeader {
        state,
        max_offset: buf.get_i64(),
    })
}

pub fn encode_data_header(hdr: &DataHeader) -> [u8; DATA_HEADER_SIZE] {
    let mut buf = [0u8; DATA_HEADER_SIZE];
    buf[0..4].copy_from_slice(&(hdr.state as u32).to_be_bytes());
    buf[4..8].copy_from_slice(&hdr.body_size.to_be_bytes());
    buf[8..16].copy_from_slice(&hdr.master_offset.to_be_bytes());
    buf[16..20].copy_from_slice(&hdr.master_epoch.to_be_bytes());
    buf[20..28].copy_from_slice(&hdr.confirm_offset.to_be_bytes());
    buf
}

pub fn decode_data_header(raw: &[u8; DATA_HEADER_SIZE]) -> HaResult<DataHeader> {
    let mut buf = &raw[..];
    let state_raw = buf.get_u32();
    let state =
        HaConnectionState::try_from(state_raw).map_err(|_| HaError::BadState(state_raw))?;
    Ok(DataHeader {
        state,
        body_size: buf.get_u32(),
        master_offset: buf.get_i64(),
        master_epoch: buf.get_u32(),
        confirm_offset: buf.get_i64(),
    })
}

pub fn encode_epoch_entries(entries: &[EpochEntry]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(entries.len() * EPOCH_RECORD_SIZE);
    for entry in entries {
        buf.put_u32(entry.epoch);
        buf.put_i64(entry.start_offset);
    }
    buf.to_vec()
}

pub fn decode_epoch_entries(raw: &[u8]) -> HaResult<Vec<EpochEntry>> {
    if raw.len() % EPOCH_RECORD_SIZE != 0 {
        return Err(HaError::BadFrame("epoch list not a record multiple"));
    }
    let mut buf = raw;
    let mut entries = Vec::with_capacity(raw.len() / EPOCH_RECORD_SIZE);
    while buf.remaining() >= EPOCH_RECORD_SIZE {
        let epoch = buf.get_u32();
        let start_offset = buf.get_i64();
        entries.push(EpochEntry::new(epoch, start_offset));
    }
    Ok(entries)
}

pub async fn write_transfer_header<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    hdr: &TransferHeader,
) -> HaResult<()> {
    writer.write_all(&encode_transfer_header(hdr)).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_transfer_header<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> HaResult<TransferHeader> {
    let mut raw = [0u8; TRANSFER_HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    decode_transfer_header(&raw)
}

pub async fn write_identity<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    address: &str,
) -> HaResult<()> {
    let raw = address.as_bytes();
    if raw.len() > u16::MAX as usize {
        return Err(HaError::BadFrame("identity too long"));
    }
    writer.write_all(&(raw.len() as u16).to_be_bytes()).await?;
    writer.write_all(raw).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_identity<R: AsyncReadExt + Unpin>(reader: &mut R) -> HaResult<String> {
    let mut len_raw = [0u8; 2];
    reader.read_exact(&mut len_raw).await?;
    let len = u16::from_be_bytes(len_raw) as usize;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await?;
    String::from_utf8(raw).map_err(|_| HaError::BadFrame("identity not utf-8"))
}

pub async fn write_data_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    hdr: &DataHeader,
    body: &[u8],
) -> HaResult<()> {
    debug_assert_eq!(hdr.body_size as usize, body.len());
    writer.write_all(&encode_data_header(hdr)).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn read_data_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> HaResult<(DataHeader, Vec<u8>)> {
    let mut raw = [0u8; DATA_HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let hdr = decode_data_header(&raw)?;
    let mut body = vec![0u8; hdr.body_size as usize];
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }
    Ok((hdr, body))
}
