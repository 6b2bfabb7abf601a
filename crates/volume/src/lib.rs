//! Local volume management: the mountpath registry, the FQN naming
//! scheme, per-object metadata (LOM), name-locks, on-disk markers, and
//! the atomic JSON persistence used by every replicated metadata kind.

mod deleted;
mod fqn;
mod jsp;
mod lom;
mod markers;
mod mpath;
mod nlock;
mod vmd;

pub use deleted::{empty_trash, trash};
pub use fqn::{bucket_dir, fqn, visit_content, workfile, ContentType, ParsedFqn};
pub use jsp::{load_revs, save_revs};
pub use lom::{Lom, LomCache, LomMd};
pub use markers::{marker_exists, put_marker, remove_marker, Marker};
pub use mpath::{Mountpath, MountpathFlags, Mpi, MpiSnap};
pub use nlock::{Lif, NameLocker};
pub use vmd::{Vmd, VmdMountpath};

/// Name of the move-then-async-delete staging directory, one per
/// mountpath root.
pub const DELETED_DIR: &str = ".$deleted";

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("mountpath must be an absolute path: {0}")]
    NotAbsolute(std::path::PathBuf),
    #[error("refusing to use the filesystem root as a mountpath")]
    RootForbidden,
    #[error("mountpath {0} is a path-prefix of {1}")]
    PrefixConflict(std::path::PathBuf, std::path::PathBuf),
    #[error("mountpath {0} shares filesystem {1:#x} with {2}")]
    DuplicateFsid(std::path::PathBuf, u64, std::path::PathBuf),
    #[error("mountpath {0} is not attached")]
    MpathNotFound(std::path::PathBuf),
    #[error("no available mountpaths")]
    NoMountpaths,
    #[error("object {0} does not exist")]
    ObjNotFound(String),
    #[error("corrupted object metadata: {0}")]
    CorruptedMeta(String),
    #[error("out of space on {0}")]
    Oos(std::path::PathBuf),
    #[error("fqn {0} is not under any attached mountpath")]
    ForeignFqn(std::path::PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
