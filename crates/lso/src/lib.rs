//! List-objects: a streaming, on-demand paginator. One xaction per
//! (bucket, target) serves successive pages from per-mountpath walkers
//! feeding a sorted merge; remote-backed buckets run the backend walk
//! on a single HRW-designated target that broadcasts pages to the rest.

mod merge;
mod walk;
mod xact;

pub use merge::merge_entries;
pub use walk::LocalPager;
pub use xact::{LsoFactory, LsoXact, RemoteLister, TRNAME};

use serde::{Deserialize, Serialize};

/// Page size bounds; requests outside are clamped.
pub const MAX_PAGE_SIZE: usize = 100_000;
pub const DFL_PAGE_SIZE: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum LsoError {
    #[error("list-objects xaction is gone (aborted)")]
    Gone,
    #[error("bucket {0} does not exist")]
    BucketNotFound(models::Bck),
    #[error(transparent)]
    Volume(#[from] volume::VolumeError),
    #[error("remote listing failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// LsoMsg is the paginated listing request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LsoMsg {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    /// Zero means the default page size.
    #[serde(default)]
    pub page_size: usize,
    /// Name of the last entry of the previous page; empty starts over.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub continuation_token: String,
    /// List only objects present in the cluster (no backend walk).
    #[serde(default)]
    pub cached_only: bool,
    /// Do not descend into "subdirectories" of the prefix.
    #[serde(default)]
    pub no_recursion: bool,
    /// Also list the members of archived shards (tar/tgz/zip/tar.lz4)
    /// as `shard/member` entries.
    #[serde(default)]
    pub arch_list: bool,
}

impl LsoMsg {
    pub fn clamped_page_size(&self) -> usize {
        if self.page_size == 0 {
            DFL_PAGE_SIZE
        } else {
            self.page_size.clamp(1, MAX_PAGE_SIZE)
        }
    }
}

/// Entry status codes, ordered so that the merge rule can take min().
pub mod status {
    pub const OK: u16 = 0;
    pub const MISPLACED: u16 = 1;
    pub const DELETED: u16 = 2;
}

/// LsoEntry is one listed object (or, under no-recursion, one virtual
/// directory).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LsoEntry {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub atime_ns: i64,
    /// `target-id/mountpath` of the replica that produced the entry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default)]
    pub copies: u16,
    #[serde(default)]
    pub status: u16,
    /// In-cluster (vs known only to the remote backend).
    #[serde(default)]
    pub present: bool,
    /// Virtual directory (no-recursion listings only).
    #[serde(default)]
    pub is_dir: bool,
}

/// LsoPage is one response: entries in lexicographic order plus the
/// continuation token (empty on the final page).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LsoPage {
    pub entries: Vec<LsoEntry>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub continuation_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped() {
        let mut msg = LsoMsg::default();
        assert_eq!(msg.clamped_page_size(), DFL_PAGE_SIZE);
        msg.page_size = 3;
        assert_eq!(msg.clamped_page_size(), 3);
        msg.page_size = 10 * MAX_PAGE_SIZE;
        assert_eq!(msg.clamped_page_size(), MAX_PAGE_SIZE);
    }
}
