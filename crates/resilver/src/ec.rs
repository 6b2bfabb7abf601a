use models::{Bck, BckProps, EcEncodeArgs, Id, XactKind};
use std::sync::Arc;
use volume::{ContentType, Lom, MpiSnap};
use xaction::{Xact, XactBase};

/// Slicer is the erasure-coding codec seam. The coordination core
/// decides *what* to encode and *where* slices live; the codec itself
/// (Reed-Solomon math, slice framing) is provided from outside.
pub trait Slicer: Send + Sync + 'static {
    /// Encode one object into `(slice-name, payload)` pairs: data and
    /// parity slices plus the metafile, named relative to the object.
    fn encode(
        &self,
        lom: &Lom,
        data_slices: u8,
        parity_slices: u8,
    ) -> std::io::Result<Vec<(ContentType, String, Vec<u8>)>>;
}

/// NoopSlicer encodes nothing; placement and accounting still run.
/// Used when the node is built without an EC backend, and in tests.
pub struct NoopSlicer;

impl Slicer for NoopSlicer {
    fn encode(
        &self,
        _lom: &Lom,
        _data: u8,
        _parity: u8,
    ) -> std::io::Result<Vec<(ContentType, String, Vec<u8>)>> {
        Ok(Vec::new())
    }
}

/// XactEcEncode walks the bucket's canonical objects above the size
/// limit and (re-)encodes each through the Slicer, placing every
/// produced slice on the HRW mountpath of its content-type-qualified
/// name.
pub struct XactEcEncode {
    base: XactBase,
    bck: Bck,
    args: EcEncodeArgs,
    objsize_limit: i64,
    snap: Arc<MpiSnap>,
    slicer: Arc<dyn Slicer>,
}

impl Xact for XactEcEncode {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl XactEcEncode {
    pub fn new(
        id: Id,
        bck: Bck,
        args: EcEncodeArgs,
        objsize_limit: i64,
        snap: Arc<MpiSnap>,
        slicer: Arc<dyn Slicer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: XactBase::new(id, XactKind::EcEncode, Some(bck.clone())),
            bck,
            args,
            objsize_limit,
            snap,
            slicer,
        })
    }

    pub fn run_sync(&self) {
        self.base.inc_pending();
        for mi in self.snap.available.iter() {
            if self.base.aborted() {
                break;
            }
            let snap = &self.snap;
            volume::visit_content(mi, &self.bck, ContentType::Obj, &mut |name, path| {
                if self.base.aborted() {
                    return;
                }
                let uname = self.bck.make_uname(name);
                let home = snap
                    .hrw_mountpath(&uname)
                    .map(|h| h.path == mi.path)
                    .unwrap_or(false);
                if !home {
                    return;
                }
                if let Err(err) = self.encode_one(name) {
                    self.base.add_err(format!("{}: {err}", path.display()));
                }
            });
        }
        self.base.dec_pending();
        self.base.finish();
    }

    fn encode_one(&self, objname: &str) -> Result<(), volume::VolumeError> {
        let mut lom = Lom::init(self.bck.clone(), objname, &self.snap)?;
        lom.load()?;
        if lom.md.size <= self.objsize_limit {
            // Under the limit, EC replicates instead of slicing; the
            // mirror machinery owns that path.
            return Ok(());
        }
        let slices = self
            .slicer
            .encode(&lom, self.args.data_slices, self.args.parity_slices)?;
        for (ct, slice_name, payload) in slices {
            let uname = format!("{}/{}", ct.as_dir(), self.bck.make_uname(&slice_name));
            let home = self.snap.hrw_mountpath(&uname)?;
            let fqn = volume::fqn(home, &self.bck, ct, &slice_name);
            if let Some(parent) = fqn.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&fqn, payload)?;
        }
        self.base.add_obj(lom.md.size);
        Ok(())
    }
}

pub struct EcFactory {
    pub mpi: Arc<volume::Mpi>,
    pub props: Arc<dyn Fn(&Bck) -> Option<BckProps> + Send + Sync>,
    pub slicer: Arc<dyn Slicer>,
}

impl xaction::Factory for EcFactory {
    fn kind(&self) -> XactKind {
        XactKind::EcEncode
    }

    fn start(&self, args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let bck = args
            .bck
            .clone()
            .ok_or_else(|| xaction::XactError::Failed("ec-encode requires a bucket".into()))?;
        let parsed: EcEncodeArgs = args
            .custom
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        let objsize_limit = (self.props)(&bck).map(|p| p.ec.objsize_limit).unwrap_or(0);
        let xact = XactEcEncode::new(
            id,
            bck,
            parsed,
            objsize_limit,
            self.mpi.snapshot(),
            self.slicer.clone(),
        );
        let bg = xact.clone();
        tokio::task::spawn_blocking(move || bg.run_sync());
        Ok(xact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A slicer that splits the body in half, plus a metafile.
    struct HalfSlicer;
    impl Slicer for HalfSlicer {
        fn encode(
            &self,
            lom: &Lom,
            _data: u8,
            _parity: u8,
        ) -> std::io::Result<Vec<(ContentType, String, Vec<u8>)>> {
            let body = std::fs::read(&lom.fqn)?;
            let mid = body.len() / 2;
            Ok(vec![
                (ContentType::EcSlice, format!("{}/1", lom.objname), body[..mid].to_vec()),
                (ContentType::EcSlice, format!("{}/2", lom.objname), body[mid..].to_vec()),
                (ContentType::EcMeta, lom.objname.clone(), b"meta".to_vec()),
            ])
        }
    }

    #[test]
    fn slices_land_on_their_hrw_mountpaths() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("b");
        let mut lom = Lom::init(bck.clone(), "big", &snap).unwrap();
        std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
        std::fs::write(&lom.fqn, vec![9u8; 1000]).unwrap();
        lom.md.size = 1000;
        lom.persist_now().unwrap();

        let xact = XactEcEncode::new(
            models::IdGenerator::new(16).next(),
            bck.clone(),
            EcEncodeArgs {
                data_slices: 1,
                parity_slices: 1,
                force: false,
            },
            256, // limit below the object size
            snap.clone(),
            Arc::new(HalfSlicer),
        );
        xact.run_sync();
        assert!(xact.base().finished());
        assert_eq!(xact.snap().stats.objs, 1);

        // Both slices and the metafile exist somewhere in %ec / %mt.
        let mut slices = 0;
        let mut metas = 0;
        for mi in snap.available.iter() {
            volume::visit_content(mi, &bck, ContentType::EcSlice, &mut |_n, _p| slices += 1);
            volume::visit_content(mi, &bck, ContentType::EcMeta, &mut |_n, _p| metas += 1);
        }
        assert_eq!(slices, 2);
        assert_eq!(metas, 1);
    }

    #[test]
    fn small_objects_are_skipped() {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("b");
        let mut lom = Lom::init(bck.clone(), "small", &snap).unwrap();
        std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
        std::fs::write(&lom.fqn, b"tiny").unwrap();
        lom.md.size = 4;
        lom.persist_now().unwrap();

        let xact = XactEcEncode::new(
            models::IdGenerator::new(17).next(),
            bck,
            EcEncodeArgs::default(),
            1024,
            snap,
            Arc::new(HalfSlicer),
        );
        xact.run_sync();
        assert_eq!(xact.snap().stats.objs, 0);
    }
}
