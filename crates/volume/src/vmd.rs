use crate::{load_revs, save_revs, MpiSnap, VolumeError};
use models::Revs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VmdMountpath {
    pub path: PathBuf,
    pub fsid: u64,
    pub label: String,
    pub enabled: bool,
}

/// Vmd records the configured volume: which mountpaths this target is
/// supposed to have. Compared against the live filesystem at boot to
/// detect lost or added mountpaths before the registry is built.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Vmd {
    pub version: i64,
    pub mountpaths: Vec<VmdMountpath>,
}

impl Revs for Vmd {
    const KIND: &'static str = "vmd";
    const FNAME: &'static str = ".strand.vmd";

    fn version(&self) -> i64 {
        self.version
    }
    fn bump(&mut self) {
        self.version += 1;
    }
}

impl Vmd {
    /// Snapshot the current registry state into a new Vmd revision and
    /// persist it everywhere.
    pub fn persist(snap: &MpiSnap, prev_version: i64) -> Result<Vmd, VolumeError> {
        let mut vmd = Vmd {
            version: prev_version + 1,
            mountpaths: Vec::new(),
        };
        for mi in &snap.available {
            vmd.mountpaths.push(VmdMountpath {
                path: mi.path.clone(),
                fsid: mi.fsid,
                label: mi.label.clone(),
                enabled: true,
            });
        }
        for mi in &snap.disabled {
            vmd.mountpaths.push(VmdMountpath {
                path: mi.path.clone(),
                fsid: mi.fsid,
                label: mi.label.clone(),
                enabled: false,
            });
        }
        save_revs(snap, &vmd)?;
        Ok(vmd)
    }

    pub fn load(snap: &MpiSnap) -> Option<Vmd> {
        load_revs(snap)
    }

    /// Mountpaths recorded in the Vmd but absent from `snap` — these
    /// were lost across a restart and require a resilver.
    pub fn lost(&self, snap: &MpiSnap) -> Vec<&VmdMountpath> {
        self.mountpaths
            .iter()
            .filter(|m| m.enabled && snap.get(&m.path).is_none())
            .collect()
    }
}
