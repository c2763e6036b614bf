//! Identity and role types for replicas.

use serde::{Deserialize, Serialize};

/// Broker ID the controller hands out to whichever replica is acting as
/// master.  Slaves always have IDs greater than this.
pub const MASTER_BROKER_ID: i64 = 0;

/// Broker ID meaning "the controller does not know this replica".  A broker
/// seeing this in its metadata must re-register before it can take a role.
pub const UNKNOWN_BROKER_ID: i64 = -1;

/// Role a broker replica is currently playing in its replica group.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BrokerRole {
    /// Not yet attached to a replica group, waiting on registration.
    Unjoined,

    /// Accepting writes and feeding slaves.
    Master,

    /// Pulling the commit log from the current master.
    Slave,
}

impl BrokerRole {
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, Self::Slave)
    }
}
