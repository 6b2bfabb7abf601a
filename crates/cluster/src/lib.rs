//! Replicated cluster metadata: versioned owners of Smap/BMD/RMD and
//! the cluster config, plus metasync — the primary-driven, best-effort
//! broadcast that converges every node onto the newest versions.

mod metasync;
mod owner;

pub use metasync::{MsyncPayload, MsyncStatus, Metasync};
pub use owner::{ApplyOutcome, Owner};

use models::{Bmd, ClusterConfig, Rmd, Smap};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("refusing to apply {kind} v{incoming}: local version is v{local}")]
    StaleVersion {
        kind: &'static str,
        incoming: i64,
        local: i64,
    },
    #[error("{kind} uuid mismatch: incoming {incoming:?}, local {local:?}")]
    UuidMismatch {
        kind: &'static str,
        incoming: String,
        local: String,
    },
    #[error(transparent)]
    Volume(#[from] volume::VolumeError),
    #[error("metasync to {node} failed: {err}")]
    SyncFailed { node: String, err: String },
}

/// The four replicated owners of one node, shared across subsystems.
pub struct Owners {
    pub smap: Arc<Owner<Smap>>,
    pub bmd: Arc<Owner<Bmd>>,
    pub rmd: Arc<Owner<Rmd>>,
    pub config: Arc<Owner<ClusterConfig>>,
}

impl Owners {
    pub fn new(
        smap: Smap,
        bmd: Bmd,
        rmd: Rmd,
        config: ClusterConfig,
        mpi: Option<Arc<volume::Mpi>>,
    ) -> Self {
        Self {
            smap: Arc::new(Owner::new(smap, mpi.clone())),
            bmd: Arc::new(Owner::new(bmd, mpi.clone())),
            rmd: Arc::new(Owner::new(rmd, mpi.clone())),
            config: Arc::new(Owner::new(config, mpi)),
        }
    }

    /// Apply an incoming metasync payload; returns the kinds actually
    /// applied (older versions are silently ignored).
    pub fn apply_payload(&self, payload: MsyncPayload) -> Vec<&'static str> {
        let mut applied = Vec::new();
        if let Some(smap) = payload.smap {
            if matches!(self.smap.apply_newer(smap), ApplyOutcome::Applied) {
                applied.push(<Smap as models::Revs>::KIND);
            }
        }
        if let Some(bmd) = payload.bmd {
            if matches!(self.bmd.apply_newer(bmd), ApplyOutcome::Applied) {
                applied.push(<Bmd as models::Revs>::KIND);
            }
        }
        if let Some(rmd) = payload.rmd {
            if matches!(self.rmd.apply_newer(rmd), ApplyOutcome::Applied) {
                applied.push(<Rmd as models::Revs>::KIND);
            }
        }
        if let Some(conf) = payload.conf {
            if matches!(self.config.apply_newer(conf), ApplyOutcome::Applied) {
                applied.push(<ClusterConfig as models::Revs>::KIND);
            }
        }
        applied
    }
}
