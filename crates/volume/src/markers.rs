use crate::{MpiSnap, VolumeError};
use std::path::{Path, PathBuf};

/// Directory of persistent markers, one per mountpath root. A marker's
/// presence after startup is the authoritative "interrupted" signal and
/// forces the corresponding xaction to resume.
pub const MARKERS_DIR: &str = ".strand.markers";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Marker {
    Rebalance,
    Resilver,
    NodeRestarted,
    NodeRestartedPrev,
}

impl Marker {
    pub fn fname(&self) -> &'static str {
        match self {
            Marker::Rebalance => "rebalance",
            Marker::Resilver => "resilver",
            Marker::NodeRestarted => "node_restarted",
            Marker::NodeRestartedPrev => "node_restarted.prev",
        }
    }
}

fn marker_path(mpath: &Path, marker: Marker) -> PathBuf {
    mpath.join(MARKERS_DIR).join(marker.fname())
}

/// Write the marker on every available mountpath; one success suffices,
/// total failure is an error.
pub fn put_marker(snap: &MpiSnap, marker: Marker) -> Result<(), VolumeError> {
    let mut last_err = None;
    let mut ok = false;
    for mi in &snap.available {
        let path = marker_path(&mi.path, marker);
        let res = std::fs::create_dir_all(path.parent().unwrap())
            .and_then(|()| std::fs::write(&path, b""));
        match res {
            Ok(()) => ok = true,
            Err(err) => {
                tracing::warn!(mpath = %mi.path.display(), %err, "failed to write marker");
                last_err = Some(err);
            }
        }
    }
    if ok {
        Ok(())
    } else {
        Err(last_err
            .map(VolumeError::Io)
            .unwrap_or(VolumeError::NoMountpaths))
    }
}

/// Remove the marker from every mountpath (missing files are fine).
pub fn remove_marker(snap: &MpiSnap, marker: Marker) {
    for mi in snap.available.iter().chain(snap.disabled.iter()) {
        let path = marker_path(&mi.path, marker);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(mpath = %mi.path.display(), %err, "failed to remove marker");
            }
        }
    }
}

/// Whether the marker exists on any mountpath.
pub fn marker_exists(snap: &MpiSnap, marker: Marker) -> bool {
    snap.available
        .iter()
        .chain(snap.disabled.iter())
        .any(|mi| marker_path(&mi.path, marker).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mpi;

    #[test]
    fn put_check_remove() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mpi = Mpi::new(true);
        mpi.attach(a.path(), "").unwrap();
        mpi.attach(b.path(), "").unwrap();
        let snap = mpi.snapshot();

        assert!(!marker_exists(&snap, Marker::Resilver));
        put_marker(&snap, Marker::Resilver).unwrap();
        assert!(marker_exists(&snap, Marker::Resilver));

        // Present on both mountpaths.
        let canon = std::fs::canonicalize(a.path()).unwrap();
        assert!(canon.join(MARKERS_DIR).join("resilver").exists());

        remove_marker(&snap, Marker::Resilver);
        assert!(!marker_exists(&snap, Marker::Resilver));
    }
}
