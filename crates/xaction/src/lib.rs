//! The xaction substrate: every long-running, cancellable, observable
//! job in the cluster — rebalance, resilver, list-objects, mirror,
//! archive, dsort — is an xaction. This crate provides the shared base
//! (state machine, pending ref-count, idle timer, abort, error
//! aggregation, snapshots), the per-node registry with its factories,
//! and finish notifications.

mod base;
mod notif;
mod registry;

pub use base::{XactBase, ERR_CAP};
pub use notif::{NotifMsg, NotifSender};
pub use registry::{Factory, Registry, RenewArgs, RenewOutcome};

use models::{Bck, Id, XactKind, XactSnap};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum XactError {
    #[error("xaction {0} not found")]
    NotFound(Id),
    #[error("no factory registered for kind {0}")]
    UnknownKind(XactKind),
    #[error("xaction {id} ({kind}) was aborted: {cause}")]
    Aborted { id: Id, kind: XactKind, cause: String },
    #[error("{0}")]
    Failed(String),
}

/// Xact is the object-safe face of a running xaction, held by the
/// registry. The kind-specific state lives in the implementing struct;
/// everything here delegates to the embedded XactBase.
pub trait Xact: Send + Sync + 'static {
    fn base(&self) -> &XactBase;
    /// Downcast hook: callers holding an `ArcXact` recover the
    /// concrete type (e.g. to drive a list-objects page).
    fn as_any(&self) -> &dyn std::any::Any;

    fn id(&self) -> Id {
        self.base().id()
    }
    fn kind(&self) -> XactKind {
        self.base().kind()
    }
    fn bck(&self) -> Option<&Bck> {
        self.base().bck()
    }
    fn snap(&self) -> XactSnap {
        self.base().snap()
    }
    fn abort(&self, cause: &str) -> bool {
        self.base().abort(cause)
    }
}

/// Convenience alias used throughout the job crates.
pub type ArcXact = Arc<dyn Xact>;
