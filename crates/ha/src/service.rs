//! Replication service shared by both endpoint roles.
//!
//! One instance per broker.  The acceptor (master side) always listens;
//! the client (slave side) runs whenever a slave target is set.  Role
//! changes arrive through [`crate::ReplicationCtl`] and reconfigure both.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use hamq_db::traits::CommitLog;
use hamq_epochlog::{EpochCache, EpochEntry};
use hamq_primitives::params::BrokerConfig;
use hamq_tasks::ShutdownGuard;
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::watch};
use tracing::*;

use crate::{client, connection, ctl::ReplicationCtl, HaResult};

/// Endpoint knobs, lifted out of the broker config.
#[derive(Clone, Debug)]
pub struct HaConfig {
    /// This broker's address, sent to the master as the connection
    /// identity during handshake.
    pub broker_address: String,
    pub listen_address: String,
    pub heartbeat_interval: Duration,
    pub housekeeping_interval: Duration,
    pub handshake_timeout: Duration,
    pub connect_retry_delay: Duration,
    pub transfer_batch_bytes: usize,
    pub in_sync_lag_bytes: u64,
    pub sync_from_last_file: bool,
}

impl HaConfig {
    pub fn from_broker_config(cfg: &BrokerConfig) -> Self {
        Self {
            broker_address: cfg.broker_address.clone(),
            listen_address: cfg.ha_listen_address.clone(),
            heartbeat_interval: Duration::from_millis(cfg.ha_send_heartbeat_interval_ms),
            housekeeping_interval: Duration::from_millis(cfg.ha_housekeeping_interval_ms),
            handshake_timeout: Duration::from_secs(5),
            connect_retry_delay: Duration::from_secs(5),
            transfer_batch_bytes: cfg.ha_transfer_batch_bytes,
            in_sync_lag_bytes: cfg.ha_in_sync_lag_bytes,
            sync_from_last_file: cfg.sync_from_last_file,
        }
    }
}

/// Where the slave pull should connect.  `None` means this broker isn't a
/// slave right now.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlaveTarget {
    pub master_ha_address: String,
    pub master_epoch: u32,
    pub broker_id: i64,
}

#[derive(Clone, Debug)]
pub(crate) struct SlaveProgress {
    pub reported_offset: i64,
    pub last_report_ms: u64,
}

pub struct HaService {
    pub(crate) config: HaConfig,
    pub(crate) store: Arc<dyn CommitLog>,
    pub(crate) epoch_cache: Arc<EpochCache>,

    /// Per-slave replication progress, keyed by slave broker address.
    pub(crate) progress: Mutex<HashMap<String, SlaveProgress>>,

    /// Ack set for the confirm-offset computation.
    sync_state_set: Mutex<BTreeSet<String>>,

    confirm_offset: AtomicI64,
    client_target: watch::Sender<Option<SlaveTarget>>,
}

impl HaService {
    pub fn new(
        config: HaConfig,
        store: Arc<dyn CommitLog>,
        epoch_cache: Arc<EpochCache>,
    ) -> Arc<Self> {
        let (client_target, _) = watch::channel(None);
        Arc::new(Self {
            config,
            store,
            epoch_cache,
            progress: Mutex::new(HashMap::new()),
            sync_state_set: Mutex::new(BTreeSet::new()),
            confirm_offset: AtomicI64::new(0),
            client_target,
        })
    }

    /// Master-side accept loop.  Runs for the life of the broker; slaves
    /// of a non-master just never connect.
    pub async fn run_acceptor(
        self: Arc<Self>,
        shutdown: ShutdownGuard,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        self.run_acceptor_with(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn run_acceptor_with(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: ShutdownGuard,
    ) -> anyhow::Result<()> {
        info!(addr = ?listener.local_addr(), "replication listener up");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "accepted replication connection");
                    let service = self.clone();
                    let guard = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connection::run_connection(service, stream, guard).await {
                            warn!(%peer, err = %e, "replication connection ended");
                        }
                    });
                }
                _ = shutdown.wait_for_shutdown() => {
                    info!("replication listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Slave-side pull loop.  Idles until a slave target is set.
    pub async fn run_client(self: Arc<Self>, shutdown: ShutdownGuard) -> anyhow::Result<()> {
        client::run_client(self, shutdown).await
    }

    pub fn epoch_cache(&self) -> &EpochCache {
        &self.epoch_cache
    }

    pub fn store(&self) -> &Arc<dyn CommitLog> {
        &self.store
    }

    pub(crate) fn subscribe_client_target(&self) -> watch::Receiver<Option<SlaveTarget>> {
        self.client_target.subscribe()
    }

    pub(crate) fn record_slave_report(&self, slave_address: &str, reported_offset: i64) {
        let now = self.store.now_ms();
        {
            let mut progress = self.progress.lock();
            progress.insert(
                slave_address.to_string(),
                SlaveProgress {
                    reported_offset,
                    last_report_ms: now,
                },
            );
        }
        self.recompute_confirm_offset();
    }

    pub(crate) fn remove_slave(&self, slave_address: &str) {
        self.progress.lock().remove(slave_address);
    }

    /// Confirm offset = min of the ISR's reported offsets and our own max.
    /// If an ISR member has no live connection we leave the watermark
    /// where it is rather than guess.
    pub(crate) fn recompute_confirm_offset(&self) {
        let Ok(max) = self.store.max_phy_offset() else {
            return;
        };
        let set = self.sync_state_set.lock().clone();
        let progress = self.progress.lock();

        let mut confirm = max;
        for member in &set {
            if member == &self.config.broker_address {
                continue;
            }
            match progress.get(member) {
                Some(p) => confirm = confirm.min(p.reported_offset),
                None => return,
            }
        }
        self.confirm_offset.store(confirm, Ordering::Release);
    }

    /// Used by the slave side: the watermark is whatever the master said,
    /// capped by what we actually hold.
    pub(crate) fn set_confirm_offset(&self, confirm: i64) {
        self.confirm_offset.store(confirm, Ordering::Release);
    }
}

impl ReplicationCtl for HaService {
    fn change_to_master(&self, master_epoch: u32) -> HaResult<()> {
        // Stop pulling before touching the log.
        let _ = self.client_target.send(None);

        let repaired = self.store.truncate_invalid_tail()?;
        self.epoch_cache.set_last_end_offset(repaired);
        if !self
            .epoch_cache
            .append_entry(EpochEntry::new(master_epoch, repaired))?
        {
            warn!(%master_epoch, "epoch entry already present, keeping existing history");
        }

        self.progress.lock().clear();
        self.confirm_offset.store(repaired, Ordering::Release);
        info!(%master_epoch, start_offset = %repaired, "replication endpoint now master");
        Ok(())
    }

    fn change_to_slave(
        &self,
        master_ha_address: String,
        master_epoch: u32,
        broker_id: i64,
    ) -> HaResult<()> {
        info!(%master_ha_address, %master_epoch, %broker_id, "replication endpoint now slave");
        self.progress.lock().clear();
        let _ = self.client_target.send(Some(SlaveTarget {
            master_ha_address,
            master_epoch,
            broker_id,
        }));
        Ok(())
    }

    fn set_sync_state_set(&self, set: BTreeSet<String>) {
        *self.sync_state_set.lock() = set;
        self.recompute_confirm_offset();
    }

    fn in_sync_slave_addresses(&self) -> Vec<String> {
        let Ok(max) = self.store.max_phy_offset() else {
            return Vec::new();
        };
        let lag = self.config.in_sync_lag_bytes as i64;
        self.progress
            .lock()
            .iter()
            .filter(|(_, p)| max - p.reported_offset <= lag)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    fn confirm_offset(&self) -> i64 {
        self.confirm_offset.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use hamq_db::stubs::StubCommitLog;

    use super::*;

    fn service_with(data: &[u8]) -> Arc<HaService> {
        let store = Arc::new(StubCommitLog::with_data(data.to_vec()));
        let cache = Arc::new(EpochCache::new_in_memory());
        let config = HaConfig::from_broker_config(&BrokerConfig::default());
        HaService::new(config, store, cache)
    }

    #[test]
    fn test_confirm_offset_min_over_isr() {
        let service = service_with(&[0u8; 100]);
        service.set_sync_state_set(
            ["127.0.0.1:10911", "s1", "s2"].map(String::from).into(),
        );

        // Nothing reported yet: watermark stays put.
        assert_eq!(service.confirm_offset(), 0);

        service.record_slave_report("s1", 80);
        assert_eq!(service.confirm_offset(), 0);
        service.record_slave_report("s2", 60);
        assert_eq!(service.confirm_offset(), 60);
        service.record_slave_report("s2", 95);
        assert_eq!(service.confirm_offset(), 80);
    }

    #[test]
    fn test_in_sync_lag_bound() {
        let service = service_with(&[0u8; 1000]);
        service.record_slave_report("near", 900);
        service.record_slave_report("far", 0);

        let mut in_sync = service.in_sync_slave_addresses();
        in_sync.sort();
        assert_eq!(in_sync, vec!["far", "near"]);

        // Tighten the bound below "far"'s lag.
        let store = Arc::new(StubCommitLog::with_data(vec![0u8; 1000]));
        let cache = Arc::new(EpochCache::new_in_memory());
        let mut config = HaConfig::from_broker_config(&BrokerConfig::default());
        config.in_sync_lag_bytes = 200;
        let service = HaService::new(config, store, cache);
        service.record_slave_report("near", 900);
        service.record_slave_report("far", 0);
        assert_eq!(service.in_sync_slave_addresses(), vec!["near"]);
    }

    #[test]
    fn test_change_to_master_opens_epoch() {
        let service = service_with(b"0123456789");
        service.change_to_master(3).unwrap();

        let entry = service.epoch_cache.last_entry().unwrap();
        assert_eq!(entry, EpochEntry::new(3, 10));
        assert_eq!(service.confirm_offset(), 10);
    }
}
