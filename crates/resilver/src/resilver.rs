use crate::MoveError;
use models::{BckProps, Id, XactKind};
use std::sync::Arc;
use volume::{ContentType, Lom, Marker, MpiSnap, ParsedFqn};
use xaction::{Xact, XactBase};

/// XactResilver re-homes this target's content after the mountpath set
/// (or HRW itself) changed: every object whose current mountpath is no
/// longer its HRW home is copied there, its replica set reconciled to
/// the bucket's mirror config; EC slices and metafiles move with the
/// same rule.
///
/// A marker on every mountpath brackets the run: present-at-boot means
/// "interrupted, run again".
pub struct XactResilver {
    base: XactBase,
    snap: Arc<MpiSnap>,
    props: Arc<dyn Fn(&models::Bck) -> Option<BckProps> + Send + Sync>,
}

impl Xact for XactResilver {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl XactResilver {
    pub fn new(
        id: Id,
        snap: Arc<MpiSnap>,
        props: Arc<dyn Fn(&models::Bck) -> Option<BckProps> + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: XactBase::new(id, XactKind::Resilver, None),
            snap,
            props,
        })
    }

    /// Blocking; run via spawn_blocking. One jogger per mountpath.
    pub fn run_sync(&self) {
        if let Err(err) = volume::put_marker(&self.snap, Marker::Resilver) {
            self.base.add_err(&err);
            self.base.abort("cannot write resilver marker");
            return;
        }
        self.base.inc_pending();

        std::thread::scope(|scope| {
            for mi in self.snap.available.iter() {
                scope.spawn(|| self.jog(mi));
            }
        });

        self.base.dec_pending();
        if self.base.aborted() {
            // Marker stays: the interrupted resilver re-runs at boot.
            return;
        }
        volume::remove_marker(&self.snap, Marker::Resilver);
        self.base.finish();
    }

    fn jog(&self, mi: &volume::Mountpath) {
        let mut paths = Vec::new();
        collect_paths(&mi.path, &mut paths);
        for path in paths {
            if self.base.aborted() {
                return;
            }
            let Ok(parsed) = ParsedFqn::parse(&self.snap, &path) else {
                continue;
            };
            let res = match parsed.ct {
                ContentType::Obj => self.resilver_object(&parsed),
                ContentType::EcSlice | ContentType::EcMeta => self.resilver_ct(&parsed),
                _ => Ok(()),
            };
            if let Err(err) = res {
                if err.is_oos() {
                    self.base.add_err(&err);
                    self.base.abort("out of space");
                    return;
                }
                self.base.add_err(format!("{}: {err}", path.display()));
            }
        }
    }

    fn resilver_object(&self, parsed: &ParsedFqn) -> Result<(), MoveError> {
        let uname = parsed.bck.make_uname(&parsed.objname);
        let home = self.snap.hrw_mountpath(&uname)?.clone();
        if home.path == parsed.mi.path {
            return Ok(());
        }

        // Misplaced: materialize at the HRW home, then reconcile the
        // replica set against the bucket's mirror config.
        let src_fqn = volume::fqn(&parsed.mi, &parsed.bck, ContentType::Obj, &parsed.objname);
        let mut src = Lom::init_at(parsed.bck.clone(), &parsed.objname, parsed.mi.clone());
        let have_md = src.load().is_ok();

        let mut dst = Lom::init_at(parsed.bck.clone(), &parsed.objname, home.clone());
        if !dst.fqn.exists() {
            if let Some(parent) = dst.fqn.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let work = volume::workfile(&home, &parsed.bck, &parsed.objname, "rsl");
            if let Some(parent) = work.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src_fqn, &work)?;
            std::fs::rename(&work, &dst.fqn)?;
        }
        if have_md {
            dst.md = src.md.clone();
            dst.md.copies.clear();
        }

        let copies = (self.props)(&parsed.bck)
            .filter(|p| p.mirror.enabled)
            .map(|p| p.mirror.copies as usize)
            .unwrap_or(1);
        if copies > 1 {
            // The stale location counts as one of the replicas.
            dst.add_copy(parsed.mi.path.clone());
            dst.persist_now()?;
            mirror::delete_extra_copies(&parsed.bck, &parsed.objname, copies, &self.snap)?;
            mirror::make_copies(&parsed.bck, &parsed.objname, copies, &self.snap)?;
        } else {
            dst.persist_now()?;
            volume::trash(&parsed.mi, &src_fqn)?;
        }
        self.base.add_obj(dst.md.size);
        Ok(())
    }

    /// EC slices and metafiles: move to the HRW mountpath of their
    /// content-type-qualified name.
    fn resilver_ct(&self, parsed: &ParsedFqn) -> Result<(), MoveError> {
        let uname = format!(
            "{}/{}",
            parsed.ct.as_dir(),
            parsed.bck.make_uname(&parsed.objname)
        );
        let home = self.snap.hrw_mountpath(&uname)?.clone();
        if home.path == parsed.mi.path {
            return Ok(());
        }
        let src = volume::fqn(&parsed.mi, &parsed.bck, parsed.ct, &parsed.objname);
        let dst = volume::fqn(&home, &parsed.bck, parsed.ct, &parsed.objname);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dst)?;
        volume::trash(&parsed.mi, &src)?;
        self.base.add_obj(0);
        Ok(())
    }
}

pub(crate) fn collect_paths(dir: &std::path::Path, out: &mut Vec<std::path::PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Skip metadata, markers, and the delete staging area.
        if name.starts_with(".strand.") || name == volume::DELETED_DIR {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_paths(&path, out);
        } else {
            out.push(path);
        }
    }
}

pub struct ResilverFactory {
    pub mpi: Arc<volume::Mpi>,
    pub props: Arc<dyn Fn(&models::Bck) -> Option<BckProps> + Send + Sync>,
}

impl xaction::Factory for ResilverFactory {
    fn kind(&self) -> XactKind {
        XactKind::Resilver
    }

    fn start(&self, _args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let xact = XactResilver::new(id, self.mpi.snapshot(), self.props.clone());
        let bg = xact.clone();
        tokio::task::spawn_blocking(move || bg.run_sync());
        Ok(xact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::Bck;
    use std::sync::Arc;

    fn props_fn(copies: u8) -> Arc<dyn Fn(&Bck) -> Option<BckProps> + Send + Sync> {
        Arc::new(move |_bck| {
            let mut props = BckProps::default();
            props.mirror.enabled = copies > 1;
            props.mirror.copies = copies;
            Some(props)
        })
    }

    #[test]
    fn misplaced_objects_move_home() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("b");

        // Place objects deliberately on a non-HRW mountpath.
        let mut misplaced = 0;
        for i in 0..12 {
            let name = format!("o-{i}");
            let uname = bck.make_uname(&name);
            let home = snap.hrw_mountpath(&uname).unwrap().clone();
            let wrong = snap
                .available
                .iter()
                .find(|mi| mi.path != home.path)
                .unwrap()
                .clone();
            let mut lom = Lom::init_at(bck.clone(), &name, wrong);
            std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
            std::fs::write(&lom.fqn, b"payload").unwrap();
            lom.md.size = 7;
            lom.persist_now().unwrap();
            misplaced += 1;
        }

        let xact = XactResilver::new(models::IdGenerator::new(13).next(), snap.clone(), props_fn(1));
        xact.run_sync();
        assert!(xact.base().finished());
        assert_eq!(xact.snap().stats.objs, misplaced);

        // Every object now lives at (only) its HRW home.
        for i in 0..12 {
            let name = format!("o-{i}");
            let mut lom = Lom::init(bck.clone(), &name, &snap).unwrap();
            lom.load().unwrap();
            assert_eq!(lom.md.size, 7);
            assert_eq!(lom.num_copies(), 1);
        }
        // The marker is gone after a clean finish.
        assert!(!volume::marker_exists(&snap, Marker::Resilver));
    }

    #[test]
    fn resilver_honors_mirror_copies() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("b");

        let name = "obj";
        let uname = bck.make_uname(name);
        let home = snap.hrw_mountpath(&uname).unwrap().clone();
        let wrong = snap
            .available
            .iter()
            .find(|mi| mi.path != home.path)
            .unwrap()
            .clone();
        let mut lom = Lom::init_at(bck.clone(), name, wrong);
        std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
        std::fs::write(&lom.fqn, b"xy").unwrap();
        lom.md.size = 2;
        lom.persist_now().unwrap();

        let xact = XactResilver::new(models::IdGenerator::new(14).next(), snap.clone(), props_fn(2));
        xact.run_sync();

        let mut homed = Lom::init(bck.clone(), name, &snap).unwrap();
        homed.load().unwrap();
        assert_eq!(homed.num_copies(), 2);
    }

    #[test]
    fn clean_tree_is_a_noop() {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("b");
        for i in 0..5 {
            let mut lom = Lom::init(bck.clone(), &format!("o-{i}"), &snap).unwrap();
            std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
            std::fs::write(&lom.fqn, b"ok").unwrap();
            lom.persist_now().unwrap();
        }

        let xact = XactResilver::new(models::IdGenerator::new(15).next(), snap.clone(), props_fn(1));
        xact.run_sync();
        assert_eq!(xact.snap().stats.objs, 0);
        assert_eq!(xact.snap().stats.errs, 0);
    }
}
