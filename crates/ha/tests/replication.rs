//! End-to-end replication over loopback sockets with stub commit logs.

use std::{sync::Arc, time::Duration};

use hamq_db::{stubs::StubCommitLog, traits::CommitLog};
use hamq_epochlog::{EpochCache, EpochEntry};
use hamq_ha::{
    service::{HaConfig, HaService},
    wire::{self, HaConnectionState, TransferHeader},
    ReplicationCtl,
};
use hamq_primitives::params::BrokerConfig;
use hamq_tasks::TaskManager;
use tokio::{net::TcpListener, time::sleep};

const MASTER: &str = "master-broker:10911";
const SLAVE: &str = "slave-broker:10911";

fn test_config(broker_address: &str) -> HaConfig {
    let mut cfg = HaConfig::from_broker_config(&BrokerConfig::default());
    cfg.broker_address = broker_address.to_string();
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.housekeeping_interval = Duration::from_millis(2_000);
    cfg.connect_retry_delay = Duration::from_millis(100);
    // Small batches force the stream across several messages.
    cfg.transfer_batch_bytes = 600;
    cfg
}

fn log_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn cache_of(entries: &[(u32, i64)], last_end: i64) -> Arc<EpochCache> {
    let cache = EpochCache::new_in_memory();
    for (epoch, start) in entries {
        cache.append_entry(EpochEntry::new(*epoch, *start)).unwrap();
    }
    cache.set_last_end_offset(last_end);
    Arc::new(cache)
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        sleep(Duration::from_millis(20)).await;
    }
}

struct Harness {
    manager: TaskManager,
    master_addr: String,
}

impl Harness {
    async fn start(master: &Arc<HaService>, slave: Option<&Arc<HaService>>) -> Self {
        let manager = TaskManager::new();
        let exec = manager.executor();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let master_addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(
            master
                .clone()
                .run_acceptor_with(listener, exec.shutdown_guard()),
        );
        if let Some(slave) = slave {
            tokio::spawn(slave.clone().run_client(exec.shutdown_guard()));
        }

        Self {
            manager,
            master_addr,
        }
    }
}

#[tokio::test]
async fn test_slave_catches_up_within_shared_epoch() {
    let data = log_bytes(3140);

    let master_store = Arc::new(StubCommitLog::with_data(data.clone()));
    let master =
        HaService::new(test_config(MASTER), master_store.clone(), cache_of(&[(1, 0), (2, 1570)], 3140));
    master.set_sync_state_set([MASTER, SLAVE].map(String::from).into());

    let slave_store = Arc::new(StubCommitLog::with_data(data[..1570].to_vec()));
    let slave = HaService::new(test_config(SLAVE), slave_store.clone(), cache_of(&[(1, 0)], 1570));

    let harness = Harness::start(&master, Some(&slave)).await;
    slave
        .change_to_slave(harness.master_addr.clone(), 2, 2)
        .unwrap();

    wait_until("slave to catch up", || {
        slave_store.max_phy_offset().unwrap() == 3140
    })
    .await;

    assert_eq!(slave_store.snapshot(), master_store.snapshot());
    assert_eq!(
        slave.epoch_cache().entries(),
        vec![EpochEntry::new(1, 0), EpochEntry::new(2, 1570)]
    );

    // With the slave fully caught up and in the ISR, the watermark reaches
    // the tail on both ends.
    wait_until("master confirm offset", || master.confirm_offset() == 3140).await;
    wait_until("slave confirm offset", || slave.confirm_offset() == 3140).await;

    let in_sync = master.in_sync_slave_addresses();
    assert_eq!(in_sync, vec![SLAVE.to_string()]);

    harness.manager.trigger_shutdown();
}

#[tokio::test]
async fn test_divergent_slave_truncates_to_shared_history() {
    let shared = log_bytes(1570);

    // New master wrote epoch 3 after a failover at 1570.
    let mut master_data = shared.clone();
    master_data.extend(std::iter::repeat(0xAA).take(1000));
    let master_store = Arc::new(StubCommitLog::with_data(master_data));
    let master = HaService::new(
        test_config(MASTER),
        master_store.clone(),
        cache_of(&[(1, 0), (3, 1570)], 2570),
    );
    master.set_sync_state_set([MASTER].map(String::from).into());

    // The old slave still carries part of the dead epoch 2.
    let mut slave_data = shared;
    slave_data.extend(std::iter::repeat(0xBB).take(400));
    let slave_store = Arc::new(StubCommitLog::with_data(slave_data));
    let slave = HaService::new(
        test_config(SLAVE),
        slave_store.clone(),
        cache_of(&[(1, 0), (2, 1570)], 1970),
    );

    let harness = Harness::start(&master, Some(&slave)).await;
    slave
        .change_to_slave(harness.master_addr.clone(), 3, 2)
        .unwrap();

    wait_until("divergent slave to resync", || {
        slave_store.snapshot() == master_store.snapshot()
    })
    .await;

    assert_eq!(
        slave.epoch_cache().entries(),
        vec![EpochEntry::new(1, 0), EpochEntry::new(3, 1570)]
    );

    harness.manager.trigger_shutdown();
}

#[tokio::test]
async fn test_blank_slave_adopts_master_floor() {
    // Master retired its log below offset 1000.
    let master_store = Arc::new(StubCommitLog::with_data(log_bytes(2000)));
    master_store.discard_before(1000);
    let master_cache = cache_of(&[(1, 0), (2, 500)], 2000);
    master_cache.truncate_prefix_before_offset(1000).unwrap();
    let master = HaService::new(test_config(MASTER), master_store.clone(), master_cache);
    master.set_sync_state_set([MASTER].map(String::from).into());

    let slave_store = Arc::new(StubCommitLog::new());
    let slave = HaService::new(
        test_config(SLAVE),
        slave_store.clone(),
        Arc::new(EpochCache::new_in_memory()),
    );

    let harness = Harness::start(&master, Some(&slave)).await;
    slave
        .change_to_slave(harness.master_addr.clone(), 2, 2)
        .unwrap();

    wait_until("blank slave to adopt floor and sync", || {
        slave_store.min_offset().unwrap() == 1000
            && slave_store.max_phy_offset().unwrap() == 2000
    })
    .await;

    assert_eq!(slave_store.snapshot(), master_store.snapshot());
    assert_eq!(slave.epoch_cache().entries(), vec![EpochEntry::new(2, 1000)]);

    harness.manager.trigger_shutdown();
}

#[tokio::test]
async fn test_master_resets_slave_below_retained_range() {
    let master_store = Arc::new(StubCommitLog::with_data(log_bytes(2000)));
    master_store.discard_before(1000);
    let master_cache = cache_of(&[(1, 0), (2, 500)], 2000);
    master_cache.truncate_prefix_before_offset(1000).unwrap();
    let master = HaService::new(test_config(MASTER), master_store, master_cache);

    let harness = Harness::start(&master, None).await;

    // Speak the wire protocol directly: handshake, then claim an offset
    // below the master's retained floor.
    let mut stream = tokio::net::TcpStream::connect(&harness.master_addr)
        .await
        .unwrap();
    wire::write_transfer_header(
        &mut stream,
        &TransferHeader {
            state: HaConnectionState::Handshake,
            max_offset: 0,
        },
    )
    .await
    .unwrap();
    wire::write_identity(&mut stream, SLAVE).await.unwrap();

    let (reply, body) = wire::read_data_message(&mut stream).await.unwrap();
    assert_eq!(reply.state, HaConnectionState::Handshake);
    assert_eq!(reply.master_offset, 2000);
    assert_eq!(
        wire::decode_epoch_entries(&body).unwrap(),
        vec![EpochEntry::new(2, 1000)]
    );

    wire::write_transfer_header(
        &mut stream,
        &TransferHeader {
            state: HaConnectionState::Transfer,
            max_offset: 0,
        },
    )
    .await
    .unwrap();

    // The master can't serve offset 0 anymore, so it restarts handshake.
    let (reset, _) = wire::read_data_message(&mut stream).await.unwrap();
    assert_eq!(reset.state, HaConnectionState::Handshake);

    harness.manager.trigger_shutdown();
}
