//! Broker-local view of the replica group.

use std::collections::BTreeSet;

use hamq_primitives::types::{BrokerRole, UNKNOWN_BROKER_ID};

/// What one broker currently believes about itself and its group.  Owned
/// by the replica state manager and only touched under its lock; the epoch
/// fields only ever move forward.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicaView {
    pub role: BrokerRole,
    pub master_address: String,
    pub master_epoch: u32,
    pub broker_id: i64,
    pub sync_state_set: BTreeSet<String>,
    pub sync_state_set_epoch: u32,
}

impl ReplicaView {
    pub fn new_unjoined() -> Self {
        Self {
            role: BrokerRole::Unjoined,
            master_address: String::new(),
            master_epoch: 0,
            broker_id: UNKNOWN_BROKER_ID,
            sync_state_set: BTreeSet::new(),
            sync_state_set_epoch: 0,
        }
    }
}

impl Default for ReplicaView {
    fn default() -> Self {
        Self::new_unjoined()
    }
}
