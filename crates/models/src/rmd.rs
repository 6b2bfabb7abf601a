use crate::Revs;
use serde::{Deserialize, Serialize};

/// Rmd is the rebalance epoch: its version is bumped by any Smap change
/// that requires data movement (join, leave, maintenance transitions).
/// Targets compare the incoming version against the epoch of their last
/// completed rebalance to decide whether to start a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rmd {
    pub version: i64,
    /// Uuid of an in-flight (or requested) resilver, empty otherwise.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resilver_id: String,
}

impl Rmd {
    pub fn new() -> Self {
        Self {
            version: 1,
            resilver_id: String::new(),
        }
    }
}

impl Revs for Rmd {
    const KIND: &'static str = "rmd";
    const FNAME: &'static str = ".strand.rmd";

    fn version(&self) -> i64 {
        self.version
    }
    fn bump(&mut self) {
        self.version += 1;
    }
}
