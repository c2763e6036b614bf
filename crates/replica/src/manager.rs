//! Replica state manager: owns the local view, polls the controller,
//! drives role transitions.
//!
//! Three periodic concerns run as independent tasks sharing this manager:
//! controller-leader discovery, broker metadata sync, and (masters only)
//! in-sync-set maintenance.  Every view mutation happens under one lock
//! with an epoch guard at the top, so transitions are serialized and only
//! ever move forward in epoch order.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use hamq_db::traits::CommitLog;
use hamq_ha::ReplicationCtl;
use hamq_primitives::prelude::*;
use hamq_rpc_types::{
    AlterSyncStateSetRequest, BrokerHeartbeatRequest, GetReplicaInfoRequest,
    RegisterBrokerRequest, SyncStateSet,
};
use hamq_state::ReplicaView;
use hamq_status::StatusChannel;
use hamq_tasks::{ShutdownGuard, TaskExecutor};
use parking_lot::Mutex;
use tokio::time::{interval, sleep};
use tracing::*;

use crate::{
    errors::ReplicaError,
    traits::{ControllerClient, NameService},
    ReplicaResult,
};

/// How often brokers report liveness to the controller.
const BROKER_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Backoff between startup registration attempts.
const STARTUP_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug)]
struct ManagerState {
    view: ReplicaView,
    controller_leader: Option<String>,
    registered: bool,
}

pub struct ReplicaStateManager {
    config: BrokerConfig,
    store: Arc<dyn CommitLog>,
    replication: Arc<dyn ReplicationCtl>,
    controller: Arc<dyn ControllerClient>,
    name_service: Arc<dyn NameService>,
    status: StatusChannel,
    state: Mutex<ManagerState>,
}

impl ReplicaStateManager {
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn CommitLog>,
        replication: Arc<dyn ReplicationCtl>,
        controller: Arc<dyn ControllerClient>,
        name_service: Arc<dyn NameService>,
        status: StatusChannel,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            replication,
            controller,
            name_service,
            status,
            state: Mutex::new(ManagerState {
                view: ReplicaView::new_unjoined(),
                controller_leader: None,
                registered: false,
            }),
        })
    }

    /// Spawns the periodic tasks.  The broker is up once registration
    /// inside the metadata-sync task succeeds.
    pub fn start(self: &Arc<Self>, executor: &TaskExecutor) {
        let manager = self.clone();
        executor.spawn_critical_async("controller-metadata-sync", move |shutdown| {
            manager.run_controller_metadata_sync(shutdown)
        });

        let manager = self.clone();
        executor.spawn_critical_async("broker-metadata-sync", move |shutdown| {
            manager.run_broker_metadata_sync(shutdown)
        });

        let manager = self.clone();
        executor.spawn_critical_async("sync-state-set-check", move |shutdown| {
            manager.run_sync_state_set_check(shutdown)
        });

        let manager = self.clone();
        executor.spawn_critical_async("broker-heartbeat", move |shutdown| {
            manager.run_broker_heartbeat(shutdown)
        });
    }

    pub fn view(&self) -> ReplicaView {
        self.state.lock().view.clone()
    }

    pub fn controller_leader(&self) -> Option<String> {
        self.state.lock().controller_leader.clone()
    }

    // ------------ T1: controller leader discovery ------------

    async fn run_controller_metadata_sync(
        self: Arc<Self>,
        mut shutdown: ShutdownGuard,
    ) -> anyhow::Result<()> {
        let mut ticker = interval(Duration::from_millis(
            self.config.sync_controller_metadata_period_ms,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync_controller_metadata().await,
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    }

    /// Probes each configured controller; the first that self-identifies
    /// as leader wins.
    pub async fn sync_controller_metadata(&self) {
        for addr in &self.config.controller_addrs {
            match self.controller.get_controller_metadata(addr).await {
                Ok(meta) if meta.is_leader => {
                    let mut st = self.state.lock();
                    if st.controller_leader.as_deref() != Some(addr.as_str()) {
                        info!(leader = %addr, "controller leader located");
                        st.controller_leader = Some(addr.clone());
                    }
                    return;
                }
                Ok(_) => {}
                Err(e) => debug!(%addr, err = %e, "controller probe failed"),
            }
        }
        warn!("no controller leader found this round");
    }

    // ------------ T2: broker metadata sync ------------

    async fn run_broker_metadata_sync(
        self: Arc<Self>,
        mut shutdown: ShutdownGuard,
    ) -> anyhow::Result<()> {
        // Startup: find a leader and register.  Controller unavailability
        // never kills the broker; we keep retrying with a short backoff.
        let mut attempts = 0u32;
        loop {
            if shutdown.should_shutdown() {
                return Ok(());
            }
            if self.controller_leader().is_none() {
                self.sync_controller_metadata().await;
            }
            if let Some(leader) = self.controller_leader() {
                match self.register_with_controller(&leader).await {
                    Ok(()) => break,
                    Err(e) => warn!(err = %e, "broker registration failed"),
                }
            }
            attempts += 1;
            if attempts == 3 {
                warn!("controller unreachable after 3 attempts, still retrying");
            }
            tokio::select! {
                _ = sleep(Duration::from_millis(STARTUP_RETRY_DELAY_MS)) => {}
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }

        let mut ticker = interval(Duration::from_millis(
            self.config.sync_broker_metadata_period_ms,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_broker_metadata().await {
                        warn!(err = %e, "broker metadata sync failed");
                    }
                }
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    }

    /// Registers with the controller and adopts whatever role it hands
    /// back: first replica becomes master, later ones slave to whoever
    /// holds the group.
    pub async fn register_with_controller(&self, leader: &str) -> ReplicaResult<()> {
        let req = RegisterBrokerRequest {
            cluster_name: self.config.cluster_name.clone(),
            broker_name: self.config.broker_name.clone(),
            broker_address: self.config.broker_address.clone(),
            broker_ha_address: Some(self.config.ha_listen_address.clone()),
        };
        let resp = self.controller.register_broker(leader, req).await?;
        info!(
            broker_id = %resp.broker_id,
            master = %resp.master_address,
            epoch = %resp.master_epoch,
            "registered with controller"
        );

        let mut st = self.state.lock();
        st.registered = true;
        st.view.broker_id = resp.broker_id;
        if resp.master_address == self.config.broker_address {
            self.apply_master(&mut st, resp.master_epoch, resp.sync_state_set_epoch)?;
        } else if !resp.master_address.is_empty() {
            self.apply_slave(
                &mut st,
                resp.master_address,
                resp.master_ha_address,
                resp.master_epoch,
                resp.broker_id,
            )?;
        }
        self.status.update_view(&st.view);
        Ok(())
    }

    /// Pulls this broker's authoritative metadata and reconciles the local
    /// view: adopt a newer master, or (as master) take the controller's
    /// word on the in-sync set.
    pub async fn sync_broker_metadata(&self) -> ReplicaResult<()> {
        let leader = self
            .controller_leader()
            .ok_or(ReplicaError::NoControllerLeader)?;
        let resp = self
            .controller
            .get_replica_info(
                &leader,
                GetReplicaInfoRequest {
                    broker_name: self.config.broker_name.clone(),
                    broker_address: Some(self.config.broker_address.clone()),
                },
            )
            .await?;
        if resp.error_code != 0 {
            return Err(ReplicaError::Rejected(resp.error_code));
        }

        let needs_register = {
            let mut st = self.state.lock();
            let master_changed = !resp.master_address.is_empty()
                && resp.master_address != st.view.master_address
                && resp.master_epoch > st.view.master_epoch;

            let needs_register = if master_changed {
                if resp.master_address == self.config.broker_address {
                    self.apply_master(
                        &mut st,
                        resp.master_epoch,
                        resp.sync_state_set.sync_state_set_epoch,
                    )?;
                    false
                } else if resp.broker_id > 0 {
                    self.apply_slave(
                        &mut st,
                        resp.master_address,
                        resp.master_ha_address,
                        resp.master_epoch,
                        resp.broker_id,
                    )?;
                    false
                } else {
                    // The controller doesn't know us; rejoin from scratch.
                    true
                }
            } else {
                if st.view.role.is_master() {
                    self.change_sync_state_set(&mut st, &resp.sync_state_set);
                }
                false
            };
            self.status.update_view(&st.view);
            needs_register
        };

        if needs_register {
            warn!("controller lost track of this replica, re-registering");
            self.register_with_controller(&leader).await?;
        }
        Ok(())
    }

    // ------------ T3: in-sync set maintenance (master only) ------------

    async fn run_sync_state_set_check(
        self: Arc<Self>,
        mut shutdown: ShutdownGuard,
    ) -> anyhow::Result<()> {
        let mut ticker = interval(Duration::from_millis(
            self.config.check_sync_state_set_period_ms,
        ));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_sync_state_set().await {
                        debug!(err = %e, "sync state set check failed");
                    }
                }
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    }

    /// Proposes `{self} ∪ in-sync slaves` to the controller when it
    /// differs from the current set.  A rejection is dropped; the next
    /// metadata sync refreshes our epochs and the next check retries.
    pub async fn check_sync_state_set(&self) -> ReplicaResult<()> {
        let (leader, master_epoch, ss_epoch, current_set) = {
            let st = self.state.lock();
            if !st.view.role.is_master() {
                return Ok(());
            }
            let Some(leader) = st.controller_leader.clone() else {
                return Ok(());
            };
            (
                leader,
                st.view.master_epoch,
                st.view.sync_state_set_epoch,
                st.view.sync_state_set.clone(),
            )
        };

        let mut new_set: BTreeSet<String> = [self.config.broker_address.clone()].into();
        new_set.extend(self.replication.in_sync_slave_addresses());
        if new_set == current_set {
            return Ok(());
        }

        info!(?new_set, ?current_set, "proposing sync state set change");
        let resp = self
            .controller
            .alter_sync_state_set(
                &leader,
                AlterSyncStateSetRequest {
                    broker_name: self.config.broker_name.clone(),
                    master_address: self.config.broker_address.clone(),
                    master_epoch,
                    new_sync_state_set: new_set.into_iter().collect(),
                    sync_state_set_epoch: ss_epoch,
                },
            )
            .await?;

        if resp.error_code == 0 {
            let mut st = self.state.lock();
            self.change_sync_state_set(&mut st, &resp.sync_state_set);
            self.status.update_view(&st.view);
        } else {
            debug!(code = %resp.error_code, "controller rejected sync state set change");
        }
        Ok(())
    }

    // ------------ liveness heartbeat ------------

    async fn run_broker_heartbeat(
        self: Arc<Self>,
        mut shutdown: ShutdownGuard,
    ) -> anyhow::Result<()> {
        let mut ticker = interval(Duration::from_millis(BROKER_HEARTBEAT_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send_broker_heartbeat().await {
                        debug!(err = %e, "broker heartbeat failed");
                    }
                    self.status
                        .update_confirm_offset(self.replication.confirm_offset());
                }
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    }

    pub async fn send_broker_heartbeat(&self) -> ReplicaResult<()> {
        let (leader, registered) = {
            let st = self.state.lock();
            (st.controller_leader.clone(), st.registered)
        };
        if !registered {
            return Ok(());
        }
        let leader = leader.ok_or(ReplicaError::NoControllerLeader)?;
        let max_phy_offset = self.store.max_phy_offset()?;
        self.controller
            .broker_heartbeat(
                &leader,
                BrokerHeartbeatRequest {
                    cluster_name: self.config.cluster_name.clone(),
                    broker_name: self.config.broker_name.clone(),
                    broker_address: self.config.broker_address.clone(),
                    max_phy_offset,
                },
            )
            .await
    }

    // ------------ transitions (locked, epoch-guarded) ------------

    fn apply_master(
        &self,
        st: &mut ManagerState,
        new_epoch: u32,
        ss_epoch: u32,
    ) -> ReplicaResult<()> {
        if new_epoch <= st.view.master_epoch {
            debug!(%new_epoch, current = %st.view.master_epoch, "stale master transition ignored");
            return Ok(());
        }
        info!(%new_epoch, "transitioning to master");

        st.view.role = BrokerRole::Master;
        st.view.broker_id = MASTER_BROKER_ID;
        st.view.master_address = self.config.broker_address.clone();
        st.view.master_epoch = new_epoch;
        st.view.sync_state_set = [self.config.broker_address.clone()].into();
        if ss_epoch > st.view.sync_state_set_epoch {
            st.view.sync_state_set_epoch = ss_epoch;
        }

        self.replication.change_to_master(new_epoch)?;
        self.replication
            .set_sync_state_set(st.view.sync_state_set.clone());
        self.spawn_name_service_refresh();
        Ok(())
    }

    fn apply_slave(
        &self,
        st: &mut ManagerState,
        master_address: String,
        master_ha_address: Option<String>,
        new_epoch: u32,
        broker_id: i64,
    ) -> ReplicaResult<()> {
        if new_epoch <= st.view.master_epoch {
            debug!(%new_epoch, current = %st.view.master_epoch, "stale slave transition ignored");
            return Ok(());
        }
        info!(%master_address, %new_epoch, %broker_id, "transitioning to slave");

        st.view.role = BrokerRole::Slave;
        st.view.broker_id = broker_id;
        st.view.master_epoch = new_epoch;
        st.view.master_address = master_address.clone();

        let connect_to = master_ha_address.unwrap_or(master_address);
        self.replication
            .change_to_slave(connect_to, new_epoch, broker_id)?;
        self.spawn_name_service_refresh();
        Ok(())
    }

    fn change_sync_state_set(&self, st: &mut ManagerState, new: &SyncStateSet) {
        if new.sync_state_set_epoch <= st.view.sync_state_set_epoch {
            return;
        }
        st.view.sync_state_set = new.sync_state_set.iter().cloned().collect();
        st.view.sync_state_set_epoch = new.sync_state_set_epoch;
        self.replication
            .set_sync_state_set(st.view.sync_state_set.clone());
    }

    fn spawn_name_service_refresh(&self) {
        let name_service = self.name_service.clone();
        tokio::spawn(async move {
            if let Err(e) = name_service.register_broker_all(true).await {
                warn!(err = %e, "name service registration failed");
            }
        });
    }
}
