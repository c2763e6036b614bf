//! Events the controller emits when replica metadata changes.
//!
//! Request handlers are pure: they read a snapshot of [`crate::ReplicaInfo`]
//! and produce events.  The consensus layer durably commits events, then a
//! single applier feeds them through [`apply_event`], the only writer.

use std::collections::{BTreeMap, BTreeSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::replica_info::ReplicaInfo;

#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum RegistryEvent {
    /// A replica joined the group and got a broker ID.
    BrokerRegistered {
        cluster_name: String,
        broker_name: String,
        broker_address: String,
        /// Replication-transport address; empty when not advertised.
        broker_ha_address: String,
        broker_id: i64,
    },

    /// A master election concluded.  `new_master_elected` distinguishes a
    /// real handover from the "no candidate, clear the master" outcome,
    /// which leaves every epoch untouched.
    MasterElected {
        broker_name: String,
        new_master_address: String,
        master_epoch: u32,
        sync_state_set: BTreeSet<String>,
        sync_state_set_epoch: u32,
        new_master_elected: bool,
    },

    /// The master changed its in-sync set.
    SyncStateSetAltered {
        broker_name: String,
        sync_state_set: BTreeSet<String>,
        sync_state_set_epoch: u32,
    },
}

impl RegistryEvent {
    pub fn broker_name(&self) -> &str {
        match self {
            Self::BrokerRegistered { broker_name, .. } => broker_name,
            Self::MasterElected { broker_name, .. } => broker_name,
            Self::SyncStateSetAltered { broker_name, .. } => broker_name,
        }
    }
}

/// Applies one committed event to the metadata table.  Creates the group
/// record on first registration.
pub fn apply_event(table: &mut BTreeMap<String, ReplicaInfo>, event: &RegistryEvent) {
    match event {
        RegistryEvent::BrokerRegistered {
            cluster_name,
            broker_name,
            broker_address,
            broker_ha_address,
            broker_id,
        } => {
            let info = table
                .entry(broker_name.clone())
                .or_insert_with(|| ReplicaInfo::new(cluster_name.clone(), broker_name.clone()));
            info.apply_register(broker_address, broker_ha_address, *broker_id);
        }

        RegistryEvent::MasterElected {
            broker_name,
            new_master_address,
            master_epoch,
            sync_state_set,
            sync_state_set_epoch,
            new_master_elected,
        } => {
            if let Some(info) = table.get_mut(broker_name) {
                info.apply_elect(
                    new_master_address,
                    *master_epoch,
                    sync_state_set,
                    *sync_state_set_epoch,
                    *new_master_elected,
                );
            }
        }

        RegistryEvent::SyncStateSetAltered {
            broker_name,
            sync_state_set,
            sync_state_set_epoch,
        } => {
            if let Some(info) = table.get_mut(broker_name) {
                info.apply_alter_sync_state_set(sync_state_set, *sync_state_set_epoch);
            }
        }
    }
}
