//! Authoritative per-replica-group metadata held by the controller.

use std::collections::{BTreeMap, BTreeSet};

use borsh::{BorshDeserialize, BorshSerialize};
use hamq_primitives::types::UNKNOWN_BROKER_ID;

/// One replica group's record: who the master is, which term it holds, the
/// in-sync set and every replica the controller has ever registered.
///
/// Only the registry event applier mutates this; request handlers read a
/// snapshot and propose events.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ReplicaInfo {
    cluster_name: String,
    broker_name: String,

    /// Empty string when the group currently has no master.
    master_address: String,
    master_epoch: u32,

    sync_state_set: BTreeSet<String>,
    sync_state_set_epoch: u32,

    /// Address → broker ID for every registered replica.
    replica_set: BTreeMap<String, i64>,

    /// Address → replication-transport address, for replicas that gave one.
    ha_addresses: BTreeMap<String, String>,

    /// Next broker ID to hand out.  IDs are never reused.
    next_broker_id: i64,
}

impl ReplicaInfo {
    pub fn new(cluster_name: String, broker_name: String) -> Self {
        Self {
            cluster_name,
            broker_name,
            master_address: String::new(),
            master_epoch: 0,
            sync_state_set: BTreeSet::new(),
            sync_state_set_epoch: 0,
            replica_set: BTreeMap::new(),
            ha_addresses: BTreeMap::new(),
            next_broker_id: 1,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn broker_name(&self) -> &str {
        &self.broker_name
    }

    pub fn master_address(&self) -> &str {
        &self.master_address
    }

    pub fn has_master(&self) -> bool {
        !self.master_address.is_empty()
    }

    pub fn is_master(&self, address: &str) -> bool {
        !self.master_address.is_empty() && self.master_address == address
    }

    pub fn master_epoch(&self) -> u32 {
        self.master_epoch
    }

    pub fn sync_state_set(&self) -> &BTreeSet<String> {
        &self.sync_state_set
    }

    pub fn sync_state_set_epoch(&self) -> u32 {
        self.sync_state_set_epoch
    }

    pub fn replica_set(&self) -> &BTreeMap<String, i64> {
        &self.replica_set
    }

    pub fn next_broker_id(&self) -> i64 {
        self.next_broker_id
    }

    /// Broker ID of a registered address, or the unknown sentinel.
    pub fn broker_id_of(&self, address: &str) -> i64 {
        self.replica_set
            .get(address)
            .copied()
            .unwrap_or(UNKNOWN_BROKER_ID)
    }

    /// Replication-transport address a replica advertised, if any.
    pub fn ha_address_of(&self, address: &str) -> Option<&str> {
        self.ha_addresses.get(address).map(|s| s.as_str())
    }

    pub fn master_ha_address(&self) -> Option<&str> {
        if self.master_address.is_empty() {
            return None;
        }
        self.ha_address_of(&self.master_address)
    }

    /// Registers `address`, allocating the next broker ID.  Idempotent for
    /// an address that's already present, though a fresh HA address still
    /// gets recorded.
    pub fn apply_register(&mut self, address: &str, ha_address: &str, broker_id: i64) {
        if !ha_address.is_empty() {
            self.ha_addresses
                .insert(address.to_string(), ha_address.to_string());
        }
        if self.replica_set.contains_key(address) {
            return;
        }
        self.replica_set.insert(address.to_string(), broker_id);
        if broker_id >= self.next_broker_id {
            self.next_broker_id = broker_id + 1;
        }
    }

    /// Installs an election outcome.  Epochs never move backwards; a stale
    /// event is dropped on the floor.
    pub fn apply_elect(
        &mut self,
        new_master_address: &str,
        master_epoch: u32,
        sync_state_set: &BTreeSet<String>,
        sync_state_set_epoch: u32,
        new_master_elected: bool,
    ) {
        if master_epoch < self.master_epoch || sync_state_set_epoch < self.sync_state_set_epoch {
            return;
        }
        self.master_address = new_master_address.to_string();
        self.master_epoch = master_epoch;
        if new_master_elected {
            // A fresh master starts alone; slaves rejoin once caught up.
            self.sync_state_set = sync_state_set.clone();
            self.sync_state_set_epoch = sync_state_set_epoch;
        }
    }

    /// Replaces the in-sync set.  Stale epochs are dropped.
    pub fn apply_alter_sync_state_set(
        &mut self,
        sync_state_set: &BTreeSet<String>,
        sync_state_set_epoch: u32,
    ) {
        if sync_state_set_epoch <= self.sync_state_set_epoch {
            return;
        }
        self.sync_state_set = sync_state_set.clone();
        self.sync_state_set_epoch = sync_state_set_epoch;
    }
}
