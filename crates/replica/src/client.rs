//! HTTP-backed controller client.

use std::collections::HashMap;

use async_trait::async_trait;
use hamq_rpc_api::ControllerApiClient;
use hamq_rpc_types::{
    AlterSyncStateSetRequest, AlterSyncStateSetResponse, BrokerHeartbeatRequest,
    GetControllerMetaDataResponse, GetReplicaInfoRequest, GetReplicaInfoResponse,
    RegisterBrokerRequest, RegisterBrokerResponse,
};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use parking_lot::Mutex;

use crate::{errors::ReplicaError, traits::ControllerClient, ReplicaResult};

/// One cached jsonrpsee HTTP client per controller address.
#[derive(Default)]
pub struct HttpControllerClient {
    clients: Mutex<HashMap<String, HttpClient>>,
}

impl HttpControllerClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, addr: &str) -> ReplicaResult<HttpClient> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        let url = if addr.starts_with("http") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let client = HttpClientBuilder::default()
            .build(&url)
            .map_err(|e| ReplicaError::Controller(e.to_string()))?;
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

fn rpc_err(e: jsonrpsee::core::client::Error) -> ReplicaError {
    ReplicaError::Controller(e.to_string())
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn get_controller_metadata(
        &self,
        addr: &str,
    ) -> ReplicaResult<GetControllerMetaDataResponse> {
        let client = self.client(addr)?;
        ControllerApiClient::get_controller_metadata(&client)
            .await
            .map_err(rpc_err)
    }

    async fn register_broker(
        &self,
        addr: &str,
        req: RegisterBrokerRequest,
    ) -> ReplicaResult<RegisterBrokerResponse> {
        let client = self.client(addr)?;
        ControllerApiClient::register_broker(&client, req)
            .await
            .map_err(rpc_err)
    }

    async fn get_replica_info(
        &self,
        addr: &str,
        req: GetReplicaInfoRequest,
    ) -> ReplicaResult<GetReplicaInfoResponse> {
        let client = self.client(addr)?;
        ControllerApiClient::get_replica_info(&client, req)
            .await
            .map_err(rpc_err)
    }

    async fn alter_sync_state_set(
        &self,
        addr: &str,
        req: AlterSyncStateSetRequest,
    ) -> ReplicaResult<AlterSyncStateSetResponse> {
        let client = self.client(addr)?;
        ControllerApiClient::alter_sync_state_set(&client, req)
            .await
            .map_err(rpc_err)
    }

    async fn broker_heartbeat(
        &self,
        addr: &str,
        req: BrokerHeartbeatRequest,
    ) -> ReplicaResult<()> {
        let client = self.client(addr)?;
        ControllerApiClient::broker_heartbeat(&client, req)
            .await
            .map(|_| ())
            .map_err(rpc_err)
    }
}
