//! Slave-side endpoint: connect to the master, reconcile histories,
//! stream the log in.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use hamq_epochlog::{EpochCache, EpochEntry};
use hamq_tasks::ShutdownGuard;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, watch},
    time::{interval, sleep, timeout},
};
use tracing::*;

use crate::{
    errors::HaError,
    service::{HaService, SlaveTarget},
    wire::{self, DataHeader, HaConnectionState, TransferHeader},
    HaResult,
};

enum CycleEnd {
    TargetChanged,
    Shutdown,
}

pub(crate) async fn run_client(
    service: Arc<HaService>,
    mut shutdown: ShutdownGuard,
) -> anyhow::Result<()> {
    let mut target_rx = service.subscribe_client_target();

    loop {
        if shutdown.should_shutdown() {
            return Ok(());
        }

        let Some(target) = target_rx.borrow_and_update().clone() else {
            tokio::select! {
                changed = target_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        };

        match run_sync_cycle(&service, &target, &mut target_rx, &mut shutdown).await {
            Ok(CycleEnd::TargetChanged) => continue,
            Ok(CycleEnd::Shutdown) => return Ok(()),
            // The store refusing a truncation is not retryable; hold the
            // endpoint suspended until an operator or a role change
            // intervenes.
            Err(HaError::TruncateRefused(offset)) => {
                error!(%offset, "store refused truncation, suspending replication");
                tokio::select! {
                    _ = target_rx.changed() => {}
                    _ = shutdown.wait_for_shutdown() => return Ok(()),
                }
            }
            Err(e) => {
                warn!(
                    master = %target.master_ha_address,
                    err = %e,
                    "replication link failed, will reconnect"
                );
                tokio::select! {
                    _ = sleep(service.config.connect_retry_delay) => {}
                    _ = target_rx.changed() => {}
                    _ = shutdown.wait_for_shutdown() => return Ok(()),
                }
            }
        }
    }
}

/// One connection lifetime: READY → HANDSHAKE → TRANSFER until something
/// breaks or the role changes.
async fn run_sync_cycle(
    service: &Arc<HaService>,
    target: &SlaveTarget,
    target_rx: &mut watch::Receiver<Option<SlaveTarget>>,
    shutdown: &mut ShutdownGuard,
) -> HaResult<CycleEnd> {
    // READY: repair any torn tail before comparing histories.
    let repaired = service.store.truncate_invalid_tail()?;
    service.epoch_cache.truncate_suffix_from_offset(repaired)?;

    let stream = timeout(
        service.config.handshake_timeout,
        TcpStream::connect(&target.master_ha_address),
    )
    .await
    .map_err(|_| HaError::BadFrame("connect timed out"))??;
    let (mut reader, mut writer) = stream.into_split();

    // HANDSHAKE: identify ourselves, learn the master's epoch history.
    wire::write_transfer_header(
        &mut writer,
        &TransferHeader {
            state: HaConnectionState::Handshake,
            max_offset: 0,
        },
    )
    .await?;
    wire::write_identity(&mut writer, &service.config.broker_address).await?;

    let (reply, body) = timeout(
        service.config.handshake_timeout,
        wire::read_data_message(&mut reader),
    )
    .await
    .map_err(|_| HaError::BadFrame("handshake reply timed out"))??;
    if reply.state != HaConnectionState::Handshake {
        return Err(HaError::BadFrame("expected handshake reply"));
    }

    let master_entries = wire::decode_epoch_entries(&body)?;
    let start = do_truncate(service, &master_entries, reply.master_offset)?;
    info!(
        master = %target.master_ha_address,
        %start,
        epoch = %target.master_epoch,
        "histories reconciled, entering transfer"
    );

    // TRANSFER: report where we start, then consume the stream.
    report_offset(&mut writer, start).await?;

    let last_read_ms = Arc::new(AtomicU64::new(service.store.now_ms()));
    let (msg_tx, mut msg_rx) = mpsc::channel::<(DataHeader, Vec<u8>)>(16);
    let reader_task = spawn_message_reader(reader, msg_tx, last_read_ms.clone(), service);

    let mut ticker = interval(service.config.heartbeat_interval);
    let result = loop {
        tokio::select! {
            msg = msg_rx.recv() => {
                let Some((header, body)) = msg else {
                    break Err(HaError::Closed);
                };
                match handle_message(service, &mut writer, header, &body).await {
                    Ok(()) => {}
                    Err(e) => break Err(e),
                }
            }

            _ = ticker.tick() => {
                let now = service.store.now_ms();
                if now.saturating_sub(last_read_ms.load(Ordering::Acquire))
                    > service.config.housekeeping_interval.as_millis() as u64
                {
                    break Err(HaError::Closed);
                }
                let max = service.store.max_phy_offset()?;
                if let Err(e) = report_offset(&mut writer, max).await {
                    break Err(e);
                }
            }

            changed = target_rx.changed() => {
                if changed.is_err() || target_rx.borrow().as_ref() != Some(target) {
                    break Ok(CycleEnd::TargetChanged);
                }
            }

            _ = shutdown.wait_for_shutdown() => {
                break Ok(CycleEnd::Shutdown);
            }
        }
    };

    reader_task.abort();
    result
}

fn spawn_message_reader(
    mut reader: OwnedReadHalf,
    msg_tx: mpsc::Sender<(DataHeader, Vec<u8>)>,
    last_read_ms: Arc<AtomicU64>,
    service: &Arc<HaService>,
) -> tokio::task::JoinHandle<()> {
    let service = service.clone();
    tokio::spawn(async move {
        loop {
            match wire::read_data_message(&mut reader).await {
                Ok(msg) => {
                    last_read_ms.store(service.store.now_ms(), Ordering::Release);
                    if msg_tx.send(msg).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}

async fn report_offset(writer: &mut OwnedWriteHalf, offset: i64) -> HaResult<()> {
    wire::write_transfer_header(
        writer,
        &TransferHeader {
            state: HaConnectionState::Transfer,
            max_offset: offset,
        },
    )
    .await
}

/// Cuts the local log back to the last point shared with the master's
/// history.  Returns the offset replication resumes from.
fn do_truncate(
    service: &HaService,
    master_entries: &[EpochEntry],
    master_max_offset: i64,
) -> HaResult<i64> {
    let remote = EpochCache::from_entries(master_entries.to_vec(), master_max_offset);
    let local_max = service.store.max_phy_offset()?;
    let local_min = service.store.min_offset()?;
    service.epoch_cache.set_last_end_offset(local_max);

    let point = service.epoch_cache.find_consistent_point(&remote);
    if point < 0 {
        // Nothing shared.  A blank slave configured to sync from the tail
        // jumps straight there; otherwise everything we hold is garbage.
        if service.config.sync_from_last_file && local_max == local_min {
            if !service.store.reset_to_offset(master_max_offset)? {
                return Err(HaError::TruncateRefused(master_max_offset));
            }
            service.epoch_cache.truncate_suffix_from_offset(0)?;
            service.epoch_cache.set_last_end_offset(master_max_offset);
            warn!(start = %master_max_offset, "blank slave syncing from master tail");
            return Ok(master_max_offset);
        }

        // Discard the local log and resume from wherever both sides can
        // meet: our retained floor, or the master's if ours fell below it.
        let master_start = remote.first_entry().map(|e| e.start_offset).unwrap_or(0);
        let start = local_min.max(master_start);
        warn!(%local_min, %local_max, %start, "no consistent point, discarding local log");
        if !service.store.truncate_files(local_min)? {
            return Err(HaError::TruncateRefused(local_min));
        }
        if start > local_min && !service.store.reset_to_offset(start)? {
            return Err(HaError::TruncateRefused(start));
        }
        service.epoch_cache.truncate_suffix_from_offset(0)?;
        service.epoch_cache.set_last_end_offset(start);
        return Ok(start);
    }

    if !service.store.truncate_files(point)? {
        return Err(HaError::TruncateRefused(point));
    }
    service.epoch_cache.truncate_suffix_from_offset(point)?;
    if point < local_max {
        info!(%point, %local_max, "truncated divergent suffix");
    }
    Ok(point)
}

async fn handle_message(
    service: &HaService,
    writer: &mut OwnedWriteHalf,
    header: DataHeader,
    body: &[u8],
) -> HaResult<()> {
    match header.state {
        // Master pushed us back to handshake (we fell below its retained
        // range); redo the reconciliation with the fresh epoch list.
        HaConnectionState::Handshake => {
            let master_entries = wire::decode_epoch_entries(body)?;
            let start = do_truncate(service, &master_entries, header.master_offset)?;
            report_offset(writer, start).await
        }

        HaConnectionState::Transfer => {
            if body.is_empty() {
                // Heartbeat still carries the watermark.
                let max = service.store.max_phy_offset()?;
                service.set_confirm_offset(header.confirm_offset.min(max));
                return Ok(());
            }

            let local_max = service.store.max_phy_offset()?;
            if local_max != header.master_offset {
                return Err(HaError::OffsetMismatch {
                    local: local_max,
                    master: header.master_offset,
                });
            }

            // First bytes of a new term open its epoch entry.
            let local_epoch = service.epoch_cache.last_entry().map(|e| e.epoch);
            if local_epoch != Some(header.master_epoch) {
                if !service.epoch_cache.append_entry(EpochEntry::new(
                    header.master_epoch,
                    header.master_offset,
                ))? {
                    return Err(HaError::BadFrame("master epoch regressed"));
                }
            }

            if !service
                .store
                .append_to_commit_log(header.master_offset, body)?
            {
                return Err(HaError::OffsetMismatch {
                    local: local_max,
                    master: header.master_offset,
                });
            }

            let new_max = service.store.max_phy_offset()?;
            service.epoch_cache.set_last_end_offset(new_max);
            service.set_confirm_offset(header.confirm_offset.min(new_max));
            report_offset(writer, new_max).await
        }

        _ => Err(HaError::BadFrame("unexpected state in transfer")),
    }
}
