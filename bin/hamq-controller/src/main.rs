//! Controller binary: replica-metadata RPC service with a local durable
//! event log standing in for the consensus layer.

mod args;
mod rpc_server;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use hamq_common::logging;
use hamq_controller::service::ControllerService;
use hamq_primitives::params::ControllerConfig;
use hamq_rpc_api::ControllerApiServer;
use hamq_tasks::TaskManager;
use jsonrpsee::server::Server;
use tokio::time::interval;
use tracing::*;

use crate::{args::Args, rpc_server::ControllerRpc};

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str::<ControllerConfig>(&raw).context("parsing config")?
        }
        None => ControllerConfig::default(),
    };
    args.override_config(&mut config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    logging::init(logging::LoggerConfig::new("hamq-controller".to_string()));

    let service = Arc::new(ControllerService::open(
        &config.datadir,
        config.broker_inactive_timeout_ms,
    )?);

    let mut task_manager = TaskManager::new();
    let executor = task_manager.executor();

    // Failover scan: a master that stops heartbeating gets replaced.
    let scan_service = service.clone();
    let scan_period = Duration::from_millis(config.scan_inactive_period_ms);
    executor.spawn_critical_async("inactive-master-scan", move |mut shutdown| async move {
        let mut ticker = interval(scan_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scan_service.scan_and_elect();
                }
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    });

    let server = Server::builder()
        .build(&config.listen_address)
        .await
        .with_context(|| format!("binding rpc server on {}", config.listen_address))?;
    let rpc = ControllerRpc::new(service, vec![config.listen_address.clone()]);
    let server_handle = server.start(rpc.into_rpc());
    info!(addr = %config.listen_address, "controller rpc up");

    task_manager.monitor().await;

    let _ = server_handle.stop();
    logging::finalize();
    Ok(())
}
