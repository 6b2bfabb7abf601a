//! Local redundancy and bucket-to-bucket copying: the on-demand
//! put-copies xaction (N-way mirroring on PUT), the make-n-copies walk
//! that reconciles a whole bucket after its mirror config changes, and
//! the copy-bucket xaction.

mod copier;
mod ncopies;
mod put;
mod recv;
mod tco;

pub use copier::{delete_extra_copies, make_copies};
pub use ncopies::NCopiesFactory;
pub use put::{PutCopiesFactory, XactPut};
pub use recv::{write_object, ObjWriter};
pub use tco::{CopyBucketFactory, XactCopyBucket};

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("put-copies queue is full")]
    Burst,
    #[error(transparent)]
    Volume(#[from] volume::VolumeError),
    #[error("copy to {node} failed: {err}")]
    Remote { node: String, err: String },
}
