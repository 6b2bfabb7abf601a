use crate::{delete_extra_copies, make_copies};
use models::{Bck, Id, MakeNCopiesArgs, XactKind};
use std::sync::Arc;
use volume::{ContentType, MpiSnap};
use xaction::{Xact, XactBase};

/// XactNCopies reconciles a whole bucket to its (just-changed) mirror
/// copy count: walks every canonical object and adds or drops replicas
/// until the on-disk count matches.
pub struct XactNCopies {
    base: XactBase,
    bck: Bck,
    snap: Arc<MpiSnap>,
    want: usize,
}

impl Xact for XactNCopies {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl XactNCopies {
    pub fn new(id: Id, bck: Bck, want: usize, snap: Arc<MpiSnap>) -> Arc<Self> {
        Arc::new(Self {
            base: XactBase::new(id, XactKind::MakeNCopies, Some(bck.clone())),
            bck,
            snap,
            want,
        })
    }

    /// Blocking walk; run via spawn_blocking.
    pub fn run_sync(&self) {
        self.base.inc_pending();
        for mi in self.snap.available.iter() {
            if self.base.aborted() {
                break;
            }
            let base_dir = volume::bucket_dir(mi, &self.bck).join(ContentType::Obj.as_dir());
            if !base_dir.is_dir() {
                continue;
            }
            self.jog(&base_dir, &base_dir);
        }
        self.base.dec_pending();
        self.base.finish();
    }

    fn jog(&self, root: &std::path::Path, dir: &std::path::Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if self.base.aborted() {
                return;
            }
            let path = entry.path();
            if path.is_dir() {
                self.jog(root, &path);
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let objname = rel.to_string_lossy().replace('\\', "/");

            // Only the canonical (HRW) replica drives reconciliation,
            // so each object is handled exactly once.
            let uname = self.bck.make_uname(&objname);
            let is_home = self
                .snap
                .hrw_mountpath(&uname)
                .map(|home| path.starts_with(&home.path))
                .unwrap_or(false);
            if !is_home {
                continue;
            }

            let res = if self.want > 1 {
                make_copies(&self.bck, &objname, self.want, &self.snap)
            } else {
                delete_extra_copies(&self.bck, &objname, 1, &self.snap)
            };
            match res {
                Ok(changed) => {
                    if changed > 0 {
                        self.base.add_objs(changed as i64, 0);
                    }
                }
                Err(err) => self.base.add_err(format!("{objname}: {err}")),
            }
        }
    }
}

pub struct NCopiesFactory {
    pub mpi: Arc<volume::Mpi>,
}

impl xaction::Factory for NCopiesFactory {
    fn kind(&self) -> XactKind {
        XactKind::MakeNCopies
    }

    fn start(&self, args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let bck = args
            .bck
            .clone()
            .ok_or_else(|| xaction::XactError::Failed("make-n-copies requires a bucket".into()))?;
        let parsed: MakeNCopiesArgs = args
            .custom
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or_else(|| xaction::XactError::Failed("make-n-copies requires args".into()))?;
        let xact = XactNCopies::new(id, bck, parsed.copies as usize, self.mpi.snapshot());
        let bg = xact.clone();
        tokio::task::spawn_blocking(move || bg.run_sync());
        Ok(xact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volume::Lom;

    fn fixture(n: usize, objs: usize) -> (Vec<tempfile::TempDir>, Arc<MpiSnap>, Bck) {
        let dirs: Vec<_> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("b");
        for i in 0..objs {
            let mut lom = Lom::init(bck.clone(), &format!("o-{i}"), &snap).unwrap();
            std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
            std::fs::write(&lom.fqn, b"data").unwrap();
            lom.md.size = 4;
            lom.persist_now().unwrap();
        }
        (dirs, snap, bck)
    }

    #[test]
    fn walk_brings_every_object_to_n_copies() {
        let (_dirs, snap, bck) = fixture(3, 10);
        let xact = XactNCopies::new(models::IdGenerator::new(6).next(), bck.clone(), 2, snap.clone());
        xact.run_sync();
        assert!(xact.base().finished());

        for i in 0..10 {
            let mut lom = Lom::init(bck.clone(), &format!("o-{i}"), &snap).unwrap();
            lom.load().unwrap();
            assert_eq!(lom.num_copies(), 2);
        }
        // Re-running changes nothing (idempotence).
        let again = XactNCopies::new(models::IdGenerator::new(7).next(), bck, 2, snap);
        again.run_sync();
        assert_eq!(again.snap().stats.objs, 0);
    }

    #[test]
    fn reducing_to_one_drops_replicas() {
        let (_dirs, snap, bck) = fixture(3, 4);
        XactNCopies::new(models::IdGenerator::new(8).next(), bck.clone(), 3, snap.clone()).run_sync();
        XactNCopies::new(models::IdGenerator::new(9).next(), bck.clone(), 1, snap.clone()).run_sync();

        for i in 0..4 {
            let mut lom = Lom::init(bck.clone(), &format!("o-{i}"), &snap).unwrap();
            lom.load().unwrap();
            assert_eq!(lom.num_copies(), 1);
        }
    }
}
