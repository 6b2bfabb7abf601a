use models::{Bck, CopyBucketRange, Id, Smap, Template, XactKind};
use std::sync::Arc;
use volume::{ContentType, Lom, MpiSnap};
use xaction::{Xact, XactBase};

/// XactCopyBucket copies this target's share of the source bucket into
/// the destination: objects whose destination HRW owner is this target
/// are copied locally; the rest stream to their owners over the
/// transport bundle.
/// Transfer name of copy-bucket object streams.
pub const TRNAME: &str = "tco";

pub struct XactCopyBucket {
    base: XactBase,
    src: Bck,
    args: CopyBucketRange,
    snap: Arc<MpiSnap>,
    smap: Arc<Smap>,
    self_id: String,
    bundle: Option<Arc<transport::Bundle>>,
    recv: Option<Arc<transport::RecvRegistry>>,
}

impl Xact for XactCopyBucket {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl XactCopyBucket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        src: Bck,
        args: CopyBucketRange,
        snap: Arc<MpiSnap>,
        smap: Arc<Smap>,
        self_id: String,
        bundle: Option<Arc<transport::Bundle>>,
        recv: Option<Arc<transport::RecvRegistry>>,
    ) -> Arc<Self> {
        let xact = Arc::new(Self {
            base: XactBase::new(id, XactKind::CopyBucket, Some(src.clone())),
            src,
            args,
            snap,
            smap,
            self_id,
            bundle,
            recv,
        });
        // Inbound side: peers stream us the objects we own in the
        // destination bucket (the id is cluster-uniform).
        if let Some(recv) = &xact.recv {
            recv.register(
                TRNAME,
                &id.to_string(),
                Arc::new(crate::ObjWriter {
                    snap: xact.snap.clone(),
                }),
            );
        }
        xact
    }

    pub async fn run(self: Arc<Self>) {
        self.base.inc_pending();
        let res = self.copy_all().await;
        if let Err(err) = res {
            self.base.add_err(&err);
        }
        self.base.dec_pending();
        if let Some(recv) = &self.recv {
            recv.unregister(TRNAME, &self.base.id().to_string());
        }
        self.base.finish();
    }

    async fn copy_all(&self) -> Result<(), volume::VolumeError> {
        let template = if self.args.selection.template.is_empty() {
            None
        } else {
            Template::parse(&self.args.selection.template).ok()
        };
        let names = self.collect_names(&template);

        for objname in names {
            if self.base.aborted() {
                break;
            }
            if let Err(err) = self.copy_one(&objname).await {
                self.base.add_err(format!("{objname}: {err}"));
            }
        }
        Ok(())
    }

    /// Names selected by list/template, restricted to objects whose
    /// canonical replica lives here.
    fn collect_names(&self, template: &Option<Template>) -> Vec<String> {
        let mut names = Vec::new();
        if self.args.selection.is_list() {
            for name in &self.args.selection.names {
                if self.owns(name) {
                    names.push(name.clone());
                }
            }
            return names;
        }
        for mi in self.snap.available.iter() {
            let base = volume::bucket_dir(mi, &self.src).join(ContentType::Obj.as_dir());
            collect_files(&base, &base, &mut |rel| {
                let matched = template.as_ref().map(|t| t.matches(rel)).unwrap_or(true);
                if matched && self.owns_on(rel, &mi.path) {
                    names.push(rel.to_string());
                }
            });
        }
        names.sort();
        names
    }

    fn owns(&self, objname: &str) -> bool {
        let uname = self.src.make_uname(objname);
        self.snap
            .hrw_mountpath(&uname)
            .map(|home| {
                let lom_path = volume::fqn(home, &self.src, ContentType::Obj, objname);
                lom_path.exists()
            })
            .unwrap_or(false)
    }

    fn owns_on(&self, objname: &str, mi_path: &std::path::Path) -> bool {
        let uname = self.src.make_uname(objname);
        self.snap
            .hrw_mountpath(&uname)
            .map(|home| home.path == mi_path)
            .unwrap_or(false)
    }

    async fn copy_one(&self, objname: &str) -> Result<(), volume::VolumeError> {
        let mut src_lom = Lom::init(self.src.clone(), objname, &self.snap)?;
        src_lom.load()?;
        let dst_name = format!("{}{}", self.args.prepend, objname);

        if self.args.dry_run {
            self.base.add_obj(src_lom.md.size);
            return Ok(());
        }

        // Who owns the destination object cluster-wide?
        let dst_uname = self.args.to.make_uname(&dst_name);
        let dst_owner = hrw::target(&dst_uname, &self.smap).ok().map(|t| t.id.clone());

        let remote_node = match (dst_owner.as_deref(), &self.bundle) {
            (Some(owner), Some(_)) if owner != self.self_id => self.smap.get_node(owner),
            _ => None,
        };
        match (remote_node, &self.bundle) {
            (Some(node), Some(bundle)) => {
                let body = std::fs::read(&src_lom.fqn)?;
                let hdr = transport::ObjHdr {
                    bck: self.args.to.clone(),
                    objname: dst_name,
                    size: src_lom.md.size,
                    atime_ns: src_lom.md.atime_ns,
                    cksum_type: src_lom.md.cksum_type.as_str().to_string(),
                    cksum_value: src_lom.md.cksum_value.clone(),
                    opaque: Vec::new(),
                };
                bundle
                    .send(node, hdr, bytes::Bytes::from(body))
                    .await
                    .map_err(|err| {
                        volume::VolumeError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            err.to_string(),
                        ))
                    })?;
            }
            _ => {
                // Local destination (or no streams configured).
                let mut dst_lom = Lom::init(self.args.to.clone(), &dst_name, &self.snap)?;
                if let Some(parent) = dst_lom.fqn.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let work = volume::workfile(&dst_lom.mi, &self.args.to, &dst_name, "tco");
                if let Some(parent) = work.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&src_lom.fqn, &work)?;
                std::fs::rename(&work, &dst_lom.fqn)?;
                dst_lom.md = src_lom.md.clone();
                dst_lom.md.copies.clear();
                dst_lom.persist_now()?;
            }
        }
        self.base.add_obj(src_lom.md.size);
        Ok(())
    }
}

/// CopyBucketFactory builds copy-bucket xactions from the committed
/// transaction's arguments.
pub struct CopyBucketFactory {
    pub self_id: String,
    pub mpi: Arc<volume::Mpi>,
    pub smap: Arc<dyn Fn() -> Arc<Smap> + Send + Sync>,
    pub client: Option<reqwest::Client>,
    pub recv: Option<Arc<transport::RecvRegistry>>,
    pub netw_timeout: std::time::Duration,
}

impl xaction::Factory for CopyBucketFactory {
    fn kind(&self) -> XactKind {
        XactKind::CopyBucket
    }

    fn start(&self, args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let src = args
            .bck
            .clone()
            .ok_or_else(|| xaction::XactError::Failed("copy-bucket requires a bucket".into()))?;
        let parsed: CopyBucketRange = args
            .custom
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or_else(|| xaction::XactError::Failed("copy-bucket requires args".into()))?;
        let bundle = self.client.clone().map(|client| {
            Arc::new(transport::Bundle::new(
                client,
                TRNAME,
                id,
                self.self_id.clone(),
                8,
                self.netw_timeout,
            ))
        });
        let xact = XactCopyBucket::new(
            id,
            src,
            parsed,
            self.mpi.snapshot(),
            (self.smap)(),
            self.self_id.clone(),
            bundle,
            self.recv.clone(),
        );
        tokio::spawn(xact.clone().run());
        Ok(xact)
    }
}

fn collect_files(root: &std::path::Path, dir: &std::path::Path, visit: &mut impl FnMut(&str)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, visit);
        } else if let Ok(rel) = path.strip_prefix(root) {
            visit(&rel.to_string_lossy());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::ListRange;

    fn fixture(objs: &[&str]) -> (Vec<tempfile::TempDir>, Arc<MpiSnap>, Bck) {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("src");
        for name in objs {
            let mut lom = Lom::init(bck.clone(), name, &snap).unwrap();
            std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
            std::fs::write(&lom.fqn, b"payload").unwrap();
            lom.md.size = 7;
            lom.md.version = "1".into();
            lom.persist_now().unwrap();
        }
        (dirs, snap, bck)
    }

    fn xact(src: &Bck, snap: &Arc<MpiSnap>, args: CopyBucketRange) -> Arc<XactCopyBucket> {
        XactCopyBucket::new(
            models::IdGenerator::new(10).next(),
            src.clone(),
            args,
            snap.clone(),
            Arc::new(Smap::default()),
            "t1".to_string(),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn copies_everything_without_selection() {
        let (_dirs, snap, src) = fixture(&["a", "b", "sub/c"]);
        let dst = Bck::ais("dst");
        let x = xact(
            &src,
            &snap,
            CopyBucketRange {
                to: dst.clone(),
                selection: ListRange::default(),
                prepend: String::new(),
                dry_run: false,
            },
        );
        x.clone().run().await;
        assert!(x.base().finished());
        assert_eq!(x.snap().stats.objs, 3);

        for name in ["a", "b", "sub/c"] {
            let mut lom = Lom::init(dst.clone(), name, &snap).unwrap();
            lom.load().unwrap();
            assert_eq!(lom.md.size, 7);
        }
    }

    #[tokio::test]
    async fn template_selection_and_prepend() {
        let (_dirs, snap, src) = fixture(&["shard-0", "shard-1", "other"]);
        let dst = Bck::ais("dst");
        let x = xact(
            &src,
            &snap,
            CopyBucketRange {
                to: dst.clone(),
                selection: ListRange {
                    names: Vec::new(),
                    template: "shard-{0..1}".to_string(),
                },
                prepend: "v2/".to_string(),
                dry_run: false,
            },
        );
        x.clone().run().await;
        assert_eq!(x.snap().stats.objs, 2);

        let mut lom = Lom::init(dst.clone(), "v2/shard-0", &snap).unwrap();
        lom.load().unwrap();
        assert!(Lom::init(dst.clone(), "other", &snap).unwrap().load().is_err());
    }

    #[tokio::test]
    async fn dry_run_copies_nothing() {
        let (_dirs, snap, src) = fixture(&["a"]);
        let dst = Bck::ais("dst");
        let x = xact(
            &src,
            &snap,
            CopyBucketRange {
                to: dst.clone(),
                selection: ListRange::default(),
                prepend: String::new(),
                dry_run: true,
            },
        );
        x.clone().run().await;
        assert_eq!(x.snap().stats.objs, 1);
        assert!(Lom::init(dst, "a", &snap).unwrap().load().is_err());
    }
}
