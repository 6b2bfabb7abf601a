mod action;
mod bmd;
mod bucket;
mod config;
mod id;
mod node;
mod props;
mod rmd;
mod smap;
mod template;
mod xact;

pub use action::{
    ActMsg, ArchiveArgs, CopyBucketRange, DestroyBucketArgs, EcEncodeArgs, ListRange,
    MakeNCopiesArgs, RenameBucketArgs, SetPropsArgs,
};
pub use bmd::Bmd;
pub use bucket::{Bck, Ns, Provider};
pub use config::{ClusterConfig, DsortConf, LsoConf, MemReaction, MirrorConf, TimeoutConf};
pub use id::{Id, IdGenerator};
pub use node::{NodeFlags, NodeRole, NetInfo, Snode};
pub use props::{
    AccessAttrs, BckProps, ChecksumConf, ChecksumType, EcConf, MirrorProps, VersioningConf,
    WritePolicy, WritePolicyConf,
};
pub use rmd::Rmd;
pub use smap::Smap;
pub use template::Template;
pub use xact::{XactKind, XactSnap, XactStats, XactState};

/// Revs is implemented by each replicated, versioned metadata kind
/// (Smap, BMD, RMD, cluster config). Metasync pushes the latest Revs of
/// each kind; receivers apply a Revs only if its version is newer than
/// the local one.
pub trait Revs: Clone + serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync {
    /// Short stable tag carried in the metasync payload ("smap", "bmd", ...).
    const KIND: &'static str;
    /// Base name of the persisted per-mountpath file (".strand.smap", ...).
    const FNAME: &'static str;

    fn version(&self) -> i64;
    fn bump(&mut self);
    /// The cluster uuid this Revs belongs to, when it carries one.
    fn uuid(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid bucket name {0:?}")]
    InvalidBucketName(String),
    #[error("invalid backend provider {0:?}")]
    InvalidProvider(String),
    #[error("invalid number of mirror copies {copies} (expected 1..={max})")]
    InvalidNCopies { copies: u8, max: u8 },
    #[error("EC requires at least {need} targets, have {have}")]
    NotEnoughTargets { need: usize, have: usize },
    #[error("EC slice counts are immutable once enabled (use force to re-encode)")]
    EcSliceChange,
    #[error("node {0} not present in the cluster map")]
    NodeNotFound(String),
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid name template {0:?}")]
    InvalidTemplate(String),
}
