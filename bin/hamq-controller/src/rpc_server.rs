//! jsonrpsee server over the controller service.

use std::sync::Arc;

use hamq_controller::service::ControllerService;
use hamq_rpc_api::ControllerApiServer;
use hamq_rpc_types::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, BrokerHeartbeatRequest,
    BrokerHeartbeatResponse, ElectMasterRequest, ElectMasterResponse,
    GetControllerMetaDataResponse, GetReplicaInfoRequest, GetReplicaInfoResponse,
    RegisterBrokerRequest, RegisterBrokerResponse,
};
use jsonrpsee::{
    core::{async_trait, RpcResult},
    types::{error::INTERNAL_ERROR_CODE, ErrorObject, ErrorObjectOwned},
};

pub struct ControllerRpc {
    service: Arc<ControllerService>,
    peers: Vec<String>,
}

impl ControllerRpc {
    pub fn new(service: Arc<ControllerService>, peers: Vec<String>) -> Self {
        Self { service, peers }
    }
}

fn internal_err(e: hamq_controller::errors::ControllerError) -> ErrorObjectOwned {
    ErrorObject::owned(INTERNAL_ERROR_CODE, e.to_string(), None::<()>)
}

#[async_trait]
impl ControllerApiServer for ControllerRpc {
    async fn get_controller_metadata(&self) -> RpcResult<GetControllerMetaDataResponse> {
        // Single-node deployment: this process is always the leader.
        Ok(GetControllerMetaDataResponse {
            is_leader: true,
            peers: self.peers.clone(),
        })
    }

    async fn register_broker(
        &self,
        req: RegisterBrokerRequest,
    ) -> RpcResult<RegisterBrokerResponse> {
        self.service.register_broker(&req).map_err(internal_err)
    }

    async fn get_replica_info(
        &self,
        req: GetReplicaInfoRequest,
    ) -> RpcResult<GetReplicaInfoResponse> {
        self.service.get_replica_info(&req).map_err(internal_err)
    }

    async fn alter_sync_state_set(
        &self,
        req: AlterSyncStateSetRequest,
    ) -> RpcResult<AlterSyncStateSetResponse> {
        self.service.alter_sync_state_set(&req).map_err(internal_err)
    }

    async fn elect_master(&self, req: ElectMasterRequest) -> RpcResult<ElectMasterResponse> {
        self.service.elect_master(&req).map_err(internal_err)
    }

    async fn broker_heartbeat(
        &self,
        req: BrokerHeartbeatRequest,
    ) -> RpcResult<BrokerHeartbeatResponse> {
        self.service.broker_heartbeat(&req);
        Ok(BrokerHeartbeatResponse { error_code: 0 })
    }
}
