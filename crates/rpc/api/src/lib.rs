//! jsonrpsee trait for the controller's replica-metadata API.

use hamq_rpc_types::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, BrokerHeartbeatRequest,
    BrokerHeartbeatResponse, ElectMasterRequest, ElectMasterResponse, GetControllerMetaDataResponse,
    GetReplicaInfoRequest, GetReplicaInfoResponse, RegisterBrokerRequest, RegisterBrokerResponse,
};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

/// Replica-metadata API the controller leader serves.  Validation failures
/// surface as `errorCode` fields in the responses, never as RPC errors;
/// RPC errors mean transport or serialization trouble.
#[cfg_attr(not(feature = "client"), rpc(server, namespace = "controller"))]
#[cfg_attr(feature = "client", rpc(server, client, namespace = "controller"))]
pub trait ControllerApi {
    /// Identifies whether this node is the controller leader, and who else
    /// is in the quorum.
    #[method(name = "getControllerMetadata")]
    async fn get_controller_metadata(&self) -> RpcResult<GetControllerMetaDataResponse>;

    #[method(name = "registerBroker")]
    async fn register_broker(&self, req: RegisterBrokerRequest)
        -> RpcResult<RegisterBrokerResponse>;

    #[method(name = "getReplicaInfo")]
    async fn get_replica_info(&self, req: GetReplicaInfoRequest)
        -> RpcResult<GetReplicaInfoResponse>;

    #[method(name = "alterSyncStateSet")]
    async fn alter_sync_state_set(
        &self,
        req: AlterSyncStateSetRequest,
    ) -> RpcResult<AlterSyncStateSetResponse>;

    #[method(name = "electMaster")]
    async fn elect_master(&self, req: ElectMasterRequest) -> RpcResult<ElectMasterResponse>;

    #[method(name = "brokerHeartbeat")]
    async fn broker_heartbeat(
        &self,
        req: BrokerHeartbeatRequest,
    ) -> RpcResult<BrokerHeartbeatResponse>;
}
