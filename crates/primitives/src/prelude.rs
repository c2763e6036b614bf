// Re-exports for the common case where a crate wants most of this.
pub use crate::{
    codes::ReplicaErrorCode,
    params::{BrokerConfig, ControllerConfig},
    types::{BrokerRole, MASTER_BROKER_ID, UNKNOWN_BROKER_ID},
};
