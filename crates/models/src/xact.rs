use crate::{Bck, Id};
use serde::{Deserialize, Serialize};

/// XactKind enumerates every long-running job the cluster can run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum XactKind {
    Rebalance,
    Resilver,
    ListObjects,
    PutCopies,
    MakeNCopies,
    Archive,
    Dsort,
    EcEncode,
    CopyBucket,
    RenameBucket,
    DeleteObjects,
}

impl XactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            XactKind::Rebalance => "rebalance",
            XactKind::Resilver => "resilver",
            XactKind::ListObjects => "list-objects",
            XactKind::PutCopies => "put-copies",
            XactKind::MakeNCopies => "make-n-copies",
            XactKind::Archive => "archive",
            XactKind::Dsort => "dsort",
            XactKind::EcEncode => "ec-encode",
            XactKind::CopyBucket => "copy-bucket",
            XactKind::RenameBucket => "rename-bucket",
            XactKind::DeleteObjects => "delete-objects",
        }
    }

    /// On-demand kinds idle between work items and self-terminate on
    /// idle timeout; a renew returns the live instance.
    pub fn is_on_demand(&self) -> bool {
        matches!(
            self,
            XactKind::ListObjects | XactKind::PutCopies | XactKind::Archive
        )
    }

    /// Kinds that must be bound to exactly one bucket.
    pub fn is_bucket_scoped(&self) -> bool {
        !matches!(self, XactKind::Rebalance | XactKind::Resilver)
    }
}

impl std::fmt::Display for XactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XactState {
    Idle,
    Running,
    Finished,
    Aborted,
}

impl XactState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, XactState::Finished | XactState::Aborted)
    }
}

/// Aggregate counters of one xaction. Updated via atomics by any number
/// of workers; reads are per-field consistent, not transactional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XactStats {
    pub objs: i64,
    pub bytes: i64,
    pub errs: i64,
    /// Times a bounded work queue was observed full by a producer.
    pub chan_full: i64,
}

/// XactSnap is the externally visible snapshot of one xaction, served
/// by `what=all-running-xacts` and by per-id status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XactSnap {
    pub id: Id,
    pub kind: XactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bck: Option<Bck>,
    pub state: XactState,
    pub stats: XactStats,
    /// Nanoseconds since the Unix epoch; zero end time means running.
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl XactSnap {
    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }
}
