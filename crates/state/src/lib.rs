//! Replica metadata state: the controller's authoritative table entries,
//! the events that mutate them, and the broker-local view.

pub mod operation;
pub mod replica_info;
pub mod view;

pub use operation::RegistryEvent;
pub use replica_info::ReplicaInfo;
pub use view::ReplicaView;
