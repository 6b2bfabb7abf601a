use crate::{MpiSnap, VolumeError};
use models::Revs;
use std::path::Path;

/// Atomically persist `revs` to every available mountpath: write to a
/// temp file, rotate the existing copy to `.prev`, then rename into
/// place. Partial success is success; total failure is not.
pub fn save_revs<T: Revs>(snap: &MpiSnap, revs: &T) -> Result<(), VolumeError> {
    let payload = serde_json::to_vec_pretty(revs).map_err(io_invalid)?;
    let mut wrote = false;
    let mut last_err = None;
    for mi in &snap.available {
        match save_one(&mi.path, T::FNAME, &payload) {
            Ok(()) => wrote = true,
            Err(err) => {
                tracing::warn!(
                    mpath = %mi.path.display(),
                    kind = T::KIND,
                    %err,
                    "failed to persist metadata"
                );
                last_err = Some(err);
            }
        }
    }
    if wrote {
        Ok(())
    } else {
        Err(last_err.unwrap_or(VolumeError::NoMountpaths))
    }
}

fn save_one(dir: &Path, fname: &str, payload: &[u8]) -> Result<(), VolumeError> {
    let dst = dir.join(fname);
    let tmp = dir.join(format!("{fname}.tmp"));
    std::fs::write(&tmp, payload)?;
    if dst.exists() {
        let prev = dir.join(format!("{fname}.prev"));
        std::fs::rename(&dst, &prev)?;
    }
    std::fs::rename(&tmp, &dst)?;
    Ok(())
}

/// Load the newest valid copy across all mountpaths, falling back to
/// `.prev` backups. Returns None when no copy decodes.
pub fn load_revs<T: Revs>(snap: &MpiSnap) -> Option<T> {
    let mut best: Option<T> = None;
    for mi in snap.available.iter().chain(snap.disabled.iter()) {
        for fname in [T::FNAME.to_string(), format!("{}.prev", T::FNAME)] {
            let path = mi.path.join(&fname);
            let Ok(raw) = std::fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice::<T>(&raw) {
                Ok(val) => {
                    if best.as_ref().map(|b| val.version() > b.version()).unwrap_or(true) {
                        best = Some(val);
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping undecodable metadata copy");
                }
            }
        }
    }
    best
}

fn io_invalid(err: serde_json::Error) -> VolumeError {
    VolumeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mpi;
    use models::Smap;

    fn fixture(n: usize) -> (Vec<tempfile::TempDir>, std::sync::Arc<MpiSnap>) {
        let dirs: Vec<_> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        (dirs, mpi.snapshot())
    }

    #[test]
    fn save_load_round_trips() {
        let (_dirs, snap) = fixture(2);
        let mut smap = Smap::default();
        smap.version = 7;
        smap.uuid = "u".to_string();

        save_revs(&snap, &smap).unwrap();
        let loaded: Smap = load_revs(&snap).unwrap();
        assert_eq!(loaded, smap);
    }

    #[test]
    fn prev_backup_survives_a_lost_current() {
        let (dirs, snap) = fixture(1);
        let mut smap = Smap::default();
        smap.version = 1;
        save_revs(&snap, &smap).unwrap();
        smap.version = 2;
        save_revs(&snap, &smap).unwrap();

        // Corrupt the current copy; load falls back to .prev (v1).
        let canon = std::fs::canonicalize(dirs[0].path()).unwrap();
        std::fs::write(canon.join(Smap::FNAME), b"{garbage").unwrap();
        let loaded: Smap = load_revs(&snap).unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn newest_version_wins_across_mountpaths() {
        let (dirs, snap) = fixture(2);
        let mut v3 = Smap::default();
        v3.version = 3;
        let mut v5 = Smap::default();
        v5.version = 5;

        let c0 = std::fs::canonicalize(dirs[0].path()).unwrap();
        let c1 = std::fs::canonicalize(dirs[1].path()).unwrap();
        std::fs::write(c0.join(Smap::FNAME), serde_json::to_vec(&v3).unwrap()).unwrap();
        std::fs::write(c1.join(Smap::FNAME), serde_json::to_vec(&v5).unwrap()).unwrap();

        let loaded: Smap = load_revs(&snap).unwrap();
        assert_eq!(loaded.version, 5);
    }
}
