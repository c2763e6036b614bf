//! Error codes the controller returns in replica-metadata responses.
//!
//! These travel on the wire as plain `u16`s, so the discriminants here are
//! part of the protocol and must not be reordered.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
    Default,
)]
#[repr(u16)]
pub enum ReplicaErrorCode {
    #[default]
    None = 0,

    /// No replica group registered under the requested broker name.
    BrokerNotExist = 1,

    /// Request claimed mastership the requester doesn't hold.
    NotMaster = 2,

    /// Request carried a master epoch older than the current one.
    StaleMasterEpoch = 3,

    /// Request carried a sync-state-set epoch older than the current one.
    StaleSyncStateSetEpoch = 4,

    /// Proposed sync state set isn't a subset of the replica set, or the
    /// master isn't in it.
    InvalidSyncStateSet = 5,

    /// Election ran but no live candidate was available.
    ElectMasterFailed = 6,
}

impl ReplicaErrorCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::None)
    }
}
