//! Payload types for the controller API.
//!
//! Field names are part of the cross-language contract, hence the
//! camelCase renames everywhere.

use std::collections::BTreeMap;

use hamq_primitives::codes::ReplicaErrorCode;
use serde::{Deserialize, Serialize};

/// The in-sync set plus its version counter; rides along with most
/// metadata responses.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateSet {
    pub sync_state_set: Vec<String>,
    pub sync_state_set_epoch: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBrokerRequest {
    pub cluster_name: String,
    pub broker_name: String,
    pub broker_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_ha_address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBrokerResponse {
    pub broker_id: i64,
    pub master_address: String,
    pub master_epoch: u32,
    pub sync_state_set_epoch: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_ha_address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetReplicaInfoRequest {
    pub broker_name: String,
    /// When set, the response's `brokerId` is resolved for this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetReplicaInfoResponse {
    pub master_address: String,
    pub master_epoch: u32,
    pub broker_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_ha_address: Option<String>,
    pub error_code: u16,
    pub sync_state_set: SyncStateSet,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterSyncStateSetRequest {
    pub broker_name: String,
    pub master_address: String,
    pub master_epoch: u32,
    pub new_sync_state_set: Vec<String>,
    pub sync_state_set_epoch: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterSyncStateSetResponse {
    pub error_code: u16,
    pub sync_state_set: SyncStateSet,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectMasterRequest {
    pub broker_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerTableEntry {
    pub broker_id: i64,
    pub broker_address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectMasterResponse {
    /// `cluster/brokerName/brokerId` of the winner; empty when none.
    pub new_master_identity: String,
    pub new_master_address: String,
    pub master_epoch: u32,
    pub sync_state_set_epoch: u32,
    pub broker_table: BTreeMap<String, BrokerTableEntry>,
    pub error_code: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetControllerMetaDataResponse {
    pub is_leader: bool,
    pub peers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHeartbeatRequest {
    pub cluster_name: String,
    pub broker_name: String,
    pub broker_address: String,
    pub max_phy_offset: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHeartbeatResponse {
    pub error_code: u16,
}

/// Converts a response code field back to the enum, mapping anything
/// unknown to a named fallback instead of failing.
pub fn decode_error_code(raw: u16) -> ReplicaErrorCode {
    ReplicaErrorCode::try_from(raw).unwrap_or(ReplicaErrorCode::BrokerNotExist)
}
