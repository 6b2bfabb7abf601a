use crate::{Mountpath, VolumeError, DELETED_DIR};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TRASH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Move `fqn` into the mountpath's `.$deleted` staging area. Rename is
/// atomic within a filesystem, so the object disappears from its
/// canonical location instantly; reclaiming the space happens later.
pub fn trash(mi: &Mountpath, fqn: &Path) -> Result<PathBuf, VolumeError> {
    let seq = TRASH_SEQ.fetch_add(1, Ordering::Relaxed);
    let base = fqn
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = mi.path.join(DELETED_DIR);
    std::fs::create_dir_all(&staging)?;
    let dst = staging.join(format!("{seq:08x}.{base}"));
    std::fs::rename(fqn, &dst)?;
    Ok(dst)
}

/// Reclaim everything in the staging area. Called from a background
/// task and at startup.
pub fn empty_trash(mi: &Mountpath) -> Result<(), VolumeError> {
    let staging = mi.path.join(DELETED_DIR);
    let entries = match std::fs::read_dir(&staging) {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let res = if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(err) = res {
            tracing::warn!(path = %path.display(), %err, "failed to reclaim trashed entry");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mpi;

    #[test]
    fn trash_then_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let mpi = Mpi::new(true);
        let mi = mpi.attach(dir.path(), "").unwrap();

        let victim = mi.path.join("victim");
        std::fs::write(&victim, b"bye").unwrap();
        let staged = trash(&mi, &victim).unwrap();
        assert!(!victim.exists());
        assert!(staged.exists());

        empty_trash(&mi).unwrap();
        assert!(!staged.exists());
    }
}
