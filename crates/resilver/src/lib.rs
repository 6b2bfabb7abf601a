//! Data-movement xactions driven by placement changes: resilver
//! (re-home within a target after mountpath events), rebalance
//! (re-home across targets after membership changes), and the
//! ec-encode walk behind its codec seam.

mod ec;
mod rebalance;
mod resilver;

pub use ec::{EcFactory, NoopSlicer, Slicer, XactEcEncode};
pub use rebalance::{RebalanceFactory, XactRebalance};
pub use resilver::{ResilverFactory, XactResilver};

#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    #[error(transparent)]
    Volume(#[from] volume::VolumeError),
    #[error(transparent)]
    Mirror(#[from] mirror::MirrorError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error("out of space: {0}")]
    Oos(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MoveError {
    /// ENOSPC anywhere in the chain aborts the whole xaction.
    pub fn is_oos(&self) -> bool {
        match self {
            MoveError::Oos(_) => true,
            MoveError::Io(err) => err.raw_os_error() == Some(libc_enospc()),
            MoveError::Volume(volume::VolumeError::Io(err)) => {
                err.raw_os_error() == Some(libc_enospc())
            }
            MoveError::Volume(volume::VolumeError::Oos(_)) => true,
            _ => false,
        }
    }
}

fn libc_enospc() -> i32 {
    28 // ENOSPC
}
