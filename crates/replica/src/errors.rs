use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("controller rpc: {0}")]
    Controller(String),

    #[error("no controller leader known")]
    NoControllerLeader,

    #[error("controller rejected request: code {0}")]
    Rejected(u16),

    #[error("replication: {0}")]
    Replication(#[from] hamq_ha::HaError),

    #[error("store: {0}")]
    Db(#[from] hamq_db::errors::DbError),
}
