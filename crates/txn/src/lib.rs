//! The transactional control plane. Every cluster-state mutation runs
//! as a two-phase transaction driven by the primary gateway: begin on
//! the selected targets, local BMD/Smap/RMD mutation plus metasync,
//! then commit (or an abort broadcast on any begin failure).

mod coord;
mod table;
mod target;

pub use coord::{CommitResult, Coordinator};
pub use table::{Txn, TxnTable, MAX_CLOCK_SKEW};
pub use target::TargetExecutor;

use models::Bck;

#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("bucket {0} already exists")]
    BucketExists(Bck),
    #[error("bucket {0} does not exist")]
    BucketNotFound(Bck),
    #[error("{0}")]
    Precondition(String),
    #[error("transaction {uuid}: begin failed on {node}: {err}")]
    BeginFailed {
        uuid: String,
        node: String,
        err: String,
    },
    #[error("transaction {uuid}: commit failed on {node}: {err}")]
    CommitFailed {
        uuid: String,
        node: String,
        err: String,
    },
    #[error("transaction {0} not found (or expired)")]
    NotFound(String),
    #[error("duplicate transaction uuid {0}")]
    Duplicate(String),
    #[error("stale transaction timestamp (skew {0:?} over limit)")]
    Stale(std::time::Duration),
    #[error(transparent)]
    Cluster(#[from] cluster::ClusterError),
    #[error(transparent)]
    Model(#[from] models::ModelError),
    #[error(transparent)]
    Volume(#[from] volume::VolumeError),
    #[error(transparent)]
    Xact(#[from] xaction::XactError),
}
