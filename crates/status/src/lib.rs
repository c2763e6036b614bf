//! Watch-channel surface for broker replication status.
//!
//! Workers publish here, anything that wants the current role or sync
//! progress subscribes without touching the workers' locks.

use hamq_primitives::types::BrokerRole;
use hamq_state::ReplicaView;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status channel dropped")]
    ChannelDropped,
}

/// Snapshot of one broker's replication state.
#[derive(Clone, Debug, Default)]
pub struct ReplicaStatus {
    pub role: Option<BrokerRole>,
    pub master_address: String,
    pub master_epoch: u32,
    pub broker_id: i64,
    pub sync_state_set: Vec<String>,
    pub sync_state_set_epoch: u32,

    /// The master's commit watermark, or the slave's view of it.
    pub confirm_offset: i64,
}

/// Shared handle for publishing and reading [`ReplicaStatus`].
#[derive(Clone, Debug)]
pub struct StatusChannel {
    tx: watch::Sender<ReplicaStatus>,
}

impl StatusChannel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReplicaStatus::default());
        Self { tx }
    }

    /// Replaces the role-related fields from the replica view, keeping the
    /// replication-progress fields.
    pub fn update_view(&self, view: &ReplicaView) {
        self.tx.send_modify(|status| {
            status.role = Some(view.role);
            status.master_address = view.master_address.clone();
            status.master_epoch = view.master_epoch;
            status.broker_id = view.broker_id;
            status.sync_state_set = view.sync_state_set.iter().cloned().collect();
            status.sync_state_set_epoch = view.sync_state_set_epoch;
        });
    }

    pub fn update_confirm_offset(&self, confirm_offset: i64) {
        self.tx.send_modify(|status| {
            status.confirm_offset = confirm_offset;
        });
    }

    pub fn get(&self) -> ReplicaStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplicaStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_read() {
        let chan = StatusChannel::new();
        let mut view = ReplicaView::new_unjoined();
        view.role = BrokerRole::Master;
        view.master_address = "a:9000".into();
        view.master_epoch = 3;

        chan.update_view(&view);
        chan.update_confirm_offset(4096);

        let status = chan.get();
        assert_eq!(status.role, Some(BrokerRole::Master));
        assert_eq!(status.master_epoch, 3);
        assert_eq!(status.confirm_offset, 4096);
    }
}
