//! Glue between the pure registry and the durable event log.
//!
//! Stands in for the consensus layer: one lock around handle-then-commit
//! linearizes every metadata mutation, and events hit the log before they
//! are applied or answered.

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use hamq_primitives::codes::ReplicaErrorCode;
use hamq_rpc_types::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, BrokerHeartbeatRequest,
    ElectMasterRequest, ElectMasterResponse, GetReplicaInfoRequest, GetReplicaInfoResponse,
    RegisterBrokerRequest, RegisterBrokerResponse,
};
use parking_lot::Mutex;
use tracing::*;

use crate::{
    errors::ControllerError,
    event_log::EventLog,
    heartbeat::BrokerLivenessTracker,
    registry::{ControllerResult, ReplicaRegistry},
};

pub struct ControllerService {
    registry: Mutex<ReplicaRegistry>,
    event_log: EventLog,
    liveness: BrokerLivenessTracker,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("controller: clock before epoch")
        .as_millis() as u64
}

impl ControllerService {
    /// Opens the event log under `datadir` and rebuilds the table.
    pub fn open(datadir: &Path, broker_inactive_timeout_ms: u64) -> Result<Self, ControllerError> {
        std::fs::create_dir_all(datadir)?;
        let (event_log, replayed) = EventLog::open(&datadir.join("registry-events"))?;

        let mut registry = ReplicaRegistry::new();
        for ev in &replayed {
            registry.apply_event(ev);
        }
        info!(events = replayed.len(), "controller state rebuilt");

        Ok(Self {
            registry: Mutex::new(registry),
            event_log,
            liveness: BrokerLivenessTracker::new(broker_inactive_timeout_ms),
        })
    }

    pub fn liveness(&self) -> &BrokerLivenessTracker {
        &self.liveness
    }

    fn commit<R>(
        &self,
        registry: &mut ReplicaRegistry,
        result: ControllerResult<R>,
    ) -> Result<R, ControllerError> {
        for ev in &result.events {
            self.event_log.append(ev)?;
            registry.apply_event(ev);
        }
        Ok(result.response)
    }

    pub fn register_broker(
        &self,
        req: &RegisterBrokerRequest,
    ) -> Result<RegisterBrokerResponse, ControllerError> {
        let mut registry = self.registry.lock();
        let result = registry.handle_register_broker(req);
        self.commit(&mut registry, result)
    }

    pub fn get_replica_info(
        &self,
        req: &GetReplicaInfoRequest,
    ) -> Result<GetReplicaInfoResponse, ControllerError> {
        let registry = self.registry.lock();
        Ok(registry.handle_get_replica_info(req).response)
    }

    pub fn alter_sync_state_set(
        &self,
        req: &AlterSyncStateSetRequest,
    ) -> Result<AlterSyncStateSetResponse, ControllerError> {
        let mut registry = self.registry.lock();
        let result = registry.handle_alter_sync_state_set(req);
        self.commit(&mut registry, result)
    }

    pub fn elect_master(
        &self,
        req: &ElectMasterRequest,
    ) -> Result<ElectMasterResponse, ControllerError> {
        let now = now_ms();
        let mut registry = self.registry.lock();
        // A replica the tracker has never heard from gets the benefit of
        // the doubt, so operator-driven elections work before the first
        // heartbeat round lands.
        let alive = |addr: &str| {
            self.liveness.is_alive(addr, now) || self.liveness.last_info(addr).is_none()
        };
        let result = registry.handle_elect_master(req, &alive);
        self.commit(&mut registry, result)
    }

    pub fn broker_heartbeat(&self, req: &BrokerHeartbeatRequest) {
        self.liveness
            .on_heartbeat(&req.broker_address, &req.broker_name, req.max_phy_offset, now_ms());
    }

    /// One scan round: find groups whose master went quiet (or that sit
    /// masterless with live replicas) and run an election for each.
    pub fn scan_and_elect(&self) -> Vec<(String, ElectMasterResponse)> {
        let now = now_ms();
        let names = {
            let registry = self.registry.lock();
            self.liveness.scan_needs_election(&registry, now)
        };

        let mut outcomes = Vec::new();
        for broker_name in names {
            warn!(%broker_name, "master inactive, triggering election");
            match self.elect_master(&ElectMasterRequest {
                broker_name: broker_name.clone(),
            }) {
                Ok(resp) => {
                    if resp.error_code == u16::from(ReplicaErrorCode::None) {
                        info!(
                            %broker_name,
                            new_master = %resp.new_master_address,
                            epoch = %resp.master_epoch,
                            "auto failover elected new master"
                        );
                    }
                    outcomes.push((broker_name, resp));
                }
                Err(e) => {
                    error!(%broker_name, err = %e, "election failed to commit");
                }
            }
        }
        outcomes
    }
}
