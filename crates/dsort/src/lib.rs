//! Distributed sort: a three-phase xaction that extracts records from
//! input shards, merges and orders them along a pseudo-random target
//! ring, and builds the output shards. Any error on any node aborts
//! the whole job; cleanup runs in two strictly ordered stages.

mod concadj;
mod create;
mod extract;
mod manager;
mod mem;
mod record;
mod ring;
mod spec;

pub use concadj::ConcurrencyAdjuster;
pub use create::{plan_output_shards, OutShard};
pub use extract::extract_local;
pub use manager::{BodyFetcher, DsortFactory, DsortManager};
pub use mem::{MemEstimator, MemInfo, ProcMemInfo};
pub use record::{Record, RecordKey, RecordManager};
pub use ring::{merge_plan, target_ring, MergeRound};
pub use spec::{Algorithm, AlgorithmKind, ContentKeyType, DsortSpec, Ekm};

#[derive(Debug, thiserror::Error)]
pub enum DsortError {
    #[error("invalid dsort spec: {0}")]
    Spec(String),
    #[error("projected memory usage {projected} exceeds the {limit} budget")]
    Memory { projected: u64, limit: u64 },
    #[error("dsort aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Shard(#[from] shard::ShardError),
    #[error(transparent)]
    Volume(#[from] volume::VolumeError),
    #[error(transparent)]
    Model(#[from] models::ModelError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
