//! Broker binary: wires the replication endpoints and the replica state
//! manager together.
//!
//! The commit log here is the in-memory stub; a production deployment
//! plugs the real storage engine in through the same `CommitLog` trait.

mod args;

use std::sync::Arc;

use anyhow::Context;
use hamq_common::logging;
use hamq_db::{stubs::StubCommitLog, traits::CommitLog};
use hamq_epochlog::EpochCache;
use hamq_ha::{HaConfig, HaService, ReplicationCtl};
use hamq_primitives::params::BrokerConfig;
use hamq_replica::{client::HttpControllerClient, traits::NoopNameService, ReplicaStateManager};
use hamq_status::StatusChannel;
use hamq_tasks::TaskManager;
use tracing::*;

use crate::args::Args;

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str::<BrokerConfig>(&raw).context("parsing config")?
        }
        None => BrokerConfig::default(),
    };
    args.override_config(&mut config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: BrokerConfig) -> anyhow::Result<()> {
    logging::init(logging::LoggerConfig::new(format!(
        "hamq-broker-{}",
        config.broker_name
    )));

    std::fs::create_dir_all(&config.datadir)
        .with_context(|| format!("creating datadir {}", config.datadir.display()))?;
    let epoch_cache = Arc::new(EpochCache::open(config.datadir.join("epochs"))?);
    let store: Arc<dyn CommitLog> = Arc::new(StubCommitLog::new());

    let ha = HaService::new(
        HaConfig::from_broker_config(&config),
        store.clone(),
        epoch_cache,
    );
    let status = StatusChannel::new();

    let mut task_manager = TaskManager::new();
    let executor = task_manager.executor();

    let acceptor = ha.clone();
    executor.spawn_critical_async("ha-acceptor", move |shutdown| {
        acceptor.run_acceptor(shutdown)
    });
    let client = ha.clone();
    executor.spawn_critical_async("ha-client", move |shutdown| client.run_client(shutdown));

    if config.startup_controller_mode {
        let replication: Arc<dyn ReplicationCtl> = ha.clone();
        let manager = ReplicaStateManager::new(
            config.clone(),
            store.clone(),
            replication,
            Arc::new(HttpControllerClient::new()),
            Arc::new(NoopNameService),
            status.clone(),
        );
        manager.start(&executor);
    } else {
        // Static role: no controller coordination, this broker simply
        // serves as master of its own term.
        warn!("controller mode disabled, running as standalone master");
        ha.change_to_master(1)?;
    }

    // Surface role changes in the log.
    let mut status_rx = status.subscribe();
    executor.spawn_critical_async("status-log", move |mut shutdown| async move {
        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let snapshot = status_rx.borrow_and_update().clone();
                    if let Some(role) = snapshot.role {
                        info!(
                            ?role,
                            master = %snapshot.master_address,
                            epoch = %snapshot.master_epoch,
                            confirm = %snapshot.confirm_offset,
                            "replica status"
                        );
                    }
                }
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    });

    task_manager.monitor().await;
    logging::finalize();
    Ok(())
}
