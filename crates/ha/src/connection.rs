//! Master-side endpoint: one task per accepted slave connection.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use hamq_tasks::ShutdownGuard;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    time::{interval, timeout},
};
use tracing::*;

use crate::{
    ctl::ReplicationCtl,
    errors::HaError,
    service::HaService,
    wire::{self, DataHeader, HaConnectionState, TransferHeader},
    HaResult,
};

/// How often the writer side polls for new log data to push.
const TRANSFER_POLL_MS: u64 = 50;

pub(crate) async fn run_connection(
    service: Arc<HaService>,
    stream: TcpStream,
    mut shutdown: ShutdownGuard,
) -> HaResult<()> {
    let peer = stream.peer_addr()?;
    let (mut reader, mut writer) = stream.into_split();

    // The connection opens with the slave's handshake request and its
    // identity; nothing else is valid yet.
    let first = timeout(
        service.config.handshake_timeout,
        wire::read_transfer_header(&mut reader),
    )
    .await
    .map_err(|_| HaError::BadFrame("handshake timed out"))??;
    if first.state != HaConnectionState::Handshake {
        return Err(HaError::BadFrame("expected handshake request"));
    }
    let slave_address = wire::read_identity(&mut reader).await?;
    info!(%peer, %slave_address, "slave handshake");

    send_handshake_reply(&service, &mut writer).await?;

    let last_read_ms = Arc::new(AtomicU64::new(service.store.now_ms()));
    let (report_tx, mut report_rx) = mpsc::channel::<TransferHeader>(64);
    let reader_task = spawn_report_reader(reader, report_tx, last_read_ms.clone(), &service);

    let mut next_offset: Option<i64> = None;
    let mut last_write_ms = service.store.now_ms();
    let mut ticker = interval(std::time::Duration::from_millis(TRANSFER_POLL_MS));

    let result = loop {
        tokio::select! {
            report = report_rx.recv() => {
                let Some(report) = report else {
                    break Err(HaError::Closed);
                };
                match handle_report(&service, &mut writer, &slave_address, report, &mut next_offset).await {
                    Ok(()) => {}
                    Err(e) => break Err(e),
                }
            }

            _ = ticker.tick() => {
                let now = service.store.now_ms();
                if now.saturating_sub(last_read_ms.load(Ordering::Acquire))
                    > service.config.housekeeping_interval.as_millis() as u64
                {
                    warn!(%slave_address, "no reads within housekeeping window, closing");
                    break Err(HaError::Closed);
                }
                if let Some(ref mut next) = next_offset {
                    if let Err(e) =
                        push_transfer(&service, &mut writer, next, &mut last_write_ms).await
                    {
                        break Err(e);
                    }
                }
            }

            _ = shutdown.wait_for_shutdown() => {
                let _ = writer.shutdown().await;
                break Ok(());
            }
        }
    };

    reader_task.abort();
    service.remove_slave(&slave_address);
    service.recompute_confirm_offset();
    result
}

fn spawn_report_reader(
    mut reader: OwnedReadHalf,
    report_tx: mpsc::Sender<TransferHeader>,
    last_read_ms: Arc<AtomicU64>,
    service: &Arc<HaService>,
) -> tokio::task::JoinHandle<()> {
    let service = service.clone();
    tokio::spawn(async move {
        loop {
            match wire::read_transfer_header(&mut reader).await {
                Ok(header) => {
                    last_read_ms.store(service.store.now_ms(), Ordering::Release);
                    if report_tx.send(header).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}

async fn send_handshake_reply(
    service: &HaService,
    writer: &mut OwnedWriteHalf,
) -> HaResult<()> {
    let max = service.store.max_phy_offset()?;
    service.epoch_cache.set_last_end_offset(max);
    let entries = service.epoch_cache.entries();
    let body = wire::encode_epoch_entries(&entries);

    let header = DataHeader {
        state: HaConnectionState::Handshake,
        body_size: body.len() as u32,
        master_offset: max,
        master_epoch: entries.last().map(|e| e.epoch).unwrap_or(0),
        confirm_offset: service.confirm_offset(),
    };
    wire::write_data_message(writer, &header, &body).await
}

async fn handle_report(
    service: &HaService,
    writer: &mut OwnedWriteHalf,
    slave_address: &str,
    report: TransferHeader,
    next_offset: &mut Option<i64>,
) -> HaResult<()> {
    let reported = report.max_offset;

    // A slave below our retained range can't be streamed to; push it back
    // through handshake so it re-truncates against our history.
    if reported < service.store.min_offset()? {
        warn!(
            %slave_address,
            %reported,
            "slave behind retained log, restarting handshake"
        );
        *next_offset = None;
        return send_handshake_reply(service, writer).await;
    }

    trace!(%slave_address, %reported, "slave offset report");
    service.record_slave_report(slave_address, reported);
    if next_offset.is_none() {
        *next_offset = Some(reported);
    }
    Ok(())
}

/// Streams the next log range, or a heartbeat when there's nothing new.
/// A message body never crosses an epoch boundary so the header's epoch
/// covers every byte it carries.
async fn push_transfer(
    service: &HaService,
    writer: &mut OwnedWriteHalf,
    next: &mut i64,
    last_write_ms: &mut u64,
) -> HaResult<()> {
    let max = service.store.max_phy_offset()?;
    service.epoch_cache.set_last_end_offset(max);

    if max > *next {
        let entry = service
            .epoch_cache
            .entry_of_offset(*next)
            .ok_or(HaError::BadFrame("offset predates epoch history"))?;
        let epoch_end = service
            .epoch_cache
            .next_entry(entry.epoch)
            .map(|e| e.start_offset)
            .unwrap_or(i64::MAX);

        let end = max
            .min(*next + service.config.transfer_batch_bytes as i64)
            .min(epoch_end);
        let body = service
            .store
            .get_commit_log_data(*next, (end - *next) as usize)?;

        let header = DataHeader {
            state: HaConnectionState::Transfer,
            body_size: body.len() as u32,
            master_offset: *next,
            master_epoch: entry.epoch,
            confirm_offset: service.confirm_offset(),
        };
        wire::write_data_message(writer, &header, &body).await?;
        *next += body.len() as i64;
        *last_write_ms = service.store.now_ms();
        return Ok(());
    }

    // Idle: heartbeat so the slave's housekeeping doesn't fire.
    let now = service.store.now_ms();
    if now.saturating_sub(*last_write_ms) >= service.config.heartbeat_interval.as_millis() as u64 {
        let header = DataHeader {
            state: HaConnectionState::Transfer,
            body_size: 0,
            master_offset: *next,
            master_epoch: service
                .epoch_cache
                .last_entry()
                .map(|e| e.epoch)
                .unwrap_or(0),
            confirm_offset: service.confirm_offset(),
        };
        wire::write_data_message(writer, &header, &[]).await?;
        *last_write_ms = now;
    }
    Ok(())
}
