//! Collaborator seams for the state manager.

use async_trait::async_trait;
use hamq_rpc_types::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, BrokerHeartbeatRequest,
    GetControllerMetaDataResponse, GetReplicaInfoRequest, GetReplicaInfoResponse,
    RegisterBrokerRequest, RegisterBrokerResponse,
};
use tracing::*;

use crate::ReplicaResult;

/// Controller access, one method per RPC, addressed per call so the
/// manager can probe every quorum member for the leader.
#[async_trait]
pub trait ControllerClient: Send + Sync + 'static {
    async fn get_controller_metadata(
        &self,
        addr: &str,
    ) -> ReplicaResult<GetControllerMetaDataResponse>;

    async fn register_broker(
        &self,
        addr: &str,
        req: RegisterBrokerRequest,
    ) -> ReplicaResult<RegisterBrokerResponse>;

    async fn get_replica_info(
        &self,
        addr: &str,
        req: GetReplicaInfoRequest,
    ) -> ReplicaResult<GetReplicaInfoResponse>;

    async fn alter_sync_state_set(
        &self,
        addr: &str,
        req: AlterSyncStateSetRequest,
    ) -> ReplicaResult<AlterSyncStateSetResponse>;

    async fn broker_heartbeat(&self, addr: &str, req: BrokerHeartbeatRequest)
        -> ReplicaResult<()>;
}

/// Name-service registration, re-run after every role change so routing
/// metadata catches up.
#[async_trait]
pub trait NameService: Send + Sync + 'static {
    async fn register_broker_all(&self, force: bool) -> anyhow::Result<()>;
}

/// Stand-in for deployments without a name service wired up.
#[derive(Debug, Default)]
pub struct NoopNameService;

#[async_trait]
impl NameService for NoopNameService {
    async fn register_broker_all(&self, force: bool) -> anyhow::Result<()> {
        debug!(%force, "name service registration skipped (noop)");
        Ok(())
    }
}
