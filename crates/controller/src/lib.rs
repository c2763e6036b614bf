//! Controller-side replica metadata state machine.
//!
//! Request handlers are pure readers that propose [`hamq_state::RegistryEvent`]s;
//! the service commits events to a durable log and applies them through a
//! single writer.  The consensus layer proper is an external collaborator;
//! [`service::ControllerService`] stands in with a local linearizable log.

pub mod errors;
pub mod event_log;
pub mod heartbeat;
pub mod registry;
pub mod service;

pub use registry::{ControllerResult, ReplicaRegistry};
