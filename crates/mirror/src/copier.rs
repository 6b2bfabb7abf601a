use crate::MirrorError;
use models::Bck;
use std::sync::Arc;
use volume::{ContentType, Lom, Mountpath, MpiSnap, VolumeError};

/// Bring the object up to `want` total replicas, one per distinct
/// mountpath. Each new copy goes to the least-utilized eligible
/// mountpath not already holding one. Idempotent: existing copies are
/// left alone, and reaching `want` early is success.
///
/// Returns the number of copies created.
pub fn make_copies(bck: &Bck, objname: &str, want: usize, snap: &MpiSnap) -> Result<usize, MirrorError> {
    let mut lom = Lom::init(bck.clone(), objname, snap)?;
    lom.load()?;

    let mut created = 0;
    while lom.num_copies() < want {
        let Some(dst) = pick_destination(&lom, snap) else {
            break; // fewer mountpaths than requested copies
        };
        copy_replica(&lom, &dst)?;
        lom.add_copy(dst.path.clone());
        lom.persist_now()?;
        created += 1;
    }
    Ok(created)
}

/// Drop replicas beyond `want`, never touching the canonical one.
pub fn delete_extra_copies(
    bck: &Bck,
    objname: &str,
    want: usize,
    snap: &MpiSnap,
) -> Result<usize, MirrorError> {
    let mut lom = Lom::init(bck.clone(), objname, snap)?;
    lom.load()?;

    let mut deleted = 0;
    while lom.num_copies() > want.max(1) {
        let Some(victim) = lom.md.copies.iter().next().cloned() else {
            break;
        };
        if let Some(mi) = snap.get(&victim) {
            let fqn = volume::fqn(mi, bck, ContentType::Obj, objname);
            match volume::trash(mi, &fqn) {
                Ok(_) => {}
                Err(VolumeError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        lom.del_copy(&victim);
        lom.persist_now()?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Least-utilized eligible mountpath without a copy of this object.
fn pick_destination(lom: &Lom, snap: &MpiSnap) -> Option<Arc<Mountpath>> {
    snap.hrw_eligible()
        .filter(|mi| !lom.has_copy_on(&mi.path))
        .min_by_key(|mi| (mi.utilization().unwrap_or(100), mi.path.clone()))
        .cloned()
}

fn copy_replica(lom: &Lom, dst: &Mountpath) -> Result<(), MirrorError> {
    let dst_fqn = volume::fqn(dst, &lom.bck, ContentType::Obj, &lom.objname);
    if let Some(parent) = dst_fqn.parent() {
        std::fs::create_dir_all(parent).map_err(VolumeError::Io)?;
    }
    // Copy through a workfile so a torn copy is never visible under
    // the canonical name.
    let work = volume::workfile(dst, &lom.bck, &lom.objname, "copy");
    if let Some(parent) = work.parent() {
        std::fs::create_dir_all(parent).map_err(VolumeError::Io)?;
    }
    std::fs::copy(&lom.fqn, &work).map_err(VolumeError::Io)?;
    std::fs::rename(&work, &dst_fqn).map_err(VolumeError::Io)?;

    // Replicas carry the same metadata blob as the canonical copy.
    let mut replica = Lom::init_at(lom.bck.clone(), &lom.objname, Arc::new(dst.clone()));
    replica.md = lom.md.clone();
    replica.persist_now()?;
    Ok(())
}
