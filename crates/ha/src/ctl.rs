//! Narrow control surface the replica state manager drives the
//! replication layer through.  The manager never holds endpoint internals
//! and the endpoints never call back into the manager.

use std::collections::BTreeSet;

use crate::HaResult;

pub trait ReplicationCtl: Send + Sync + 'static {
    /// Take over as master for the given term: repair the local tail,
    /// start a fresh epoch at the current max offset, stop any slave pull.
    fn change_to_master(&self, master_epoch: u32) -> HaResult<()>;

    /// Start (or re-point) the slave pull at the given master.  Triggers a
    /// reconnect and a fresh handshake.
    fn change_to_slave(
        &self,
        master_ha_address: String,
        master_epoch: u32,
        broker_id: i64,
    ) -> HaResult<()>;

    /// Replace the ack set used for the confirm-offset computation.
    fn set_sync_state_set(&self, set: BTreeSet<String>);

    /// Slave broker addresses currently within the in-sync lag bound.
    fn in_sync_slave_addresses(&self) -> Vec<String>;

    /// Current commit watermark.
    fn confirm_offset(&self) -> i64;
}
