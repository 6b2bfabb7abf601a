//! The archive xaction: build one multi-member shard (tar, tar.gz,
//! zip, tar.lz4) out of many objects, cluster-wide. The HRW owner of
//! the output shard drives the writer; every other target streams its
//! matching source objects to the owner over the transport bundle.

mod xact;

pub use xact::{ArchFactory, XactArchive};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Shard(#[from] shard::ShardError),
    #[error(transparent)]
    Volume(#[from] volume::VolumeError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error("archive owner {0} is not reachable")]
    OwnerUnreachable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
