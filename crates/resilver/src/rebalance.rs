use crate::MoveError;
use models::{Id, Smap, XactKind};
use std::sync::Arc;
use volume::{ContentType, Lom, Marker, MpiSnap, ParsedFqn};
use xaction::{Xact, XactBase};

/// Transfer name of rebalance object streams.
pub const TRNAME: &str = "reb";

/// XactRebalance re-homes objects *across* targets after the active
/// target set changed (join, leave, maintenance): every local object
/// whose cluster-wide HRW owner is now some other target streams there
/// and is trashed locally. Triggered by an RMD version bump; brackets
/// itself with the rebalance marker.
pub struct XactRebalance {
    base: XactBase,
    snap: Arc<MpiSnap>,
    smap: Arc<Smap>,
    self_id: String,
    bundle: Option<Arc<transport::Bundle>>,
    recv: Option<Arc<transport::RecvRegistry>>,
}

impl Xact for XactRebalance {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl XactRebalance {
    pub fn new(
        id: Id,
        snap: Arc<MpiSnap>,
        smap: Arc<Smap>,
        self_id: String,
        bundle: Option<Arc<transport::Bundle>>,
        recv: Option<Arc<transport::RecvRegistry>>,
    ) -> Arc<Self> {
        let xact = Arc::new(Self {
            base: XactBase::new(id, XactKind::Rebalance, None),
            snap,
            smap,
            self_id,
            bundle,
            recv,
        });
        // Inbound side: every target runs the same rebalance (the id
        // derives from the RMD version), so peers can stream us the
        // objects we now own.
        if let Some(recv) = &xact.recv {
            recv.register(
                TRNAME,
                &id.to_string(),
                Arc::new(mirror::ObjWriter {
                    snap: xact.snap.clone(),
                }),
            );
        }
        xact
    }

    pub async fn run(self: Arc<Self>) {
        if let Err(err) = volume::put_marker(&self.snap, Marker::Rebalance) {
            self.base.add_err(&err);
            self.base.abort("cannot write rebalance marker");
            return;
        }
        self.base.inc_pending();

        let paths = {
            let mut all = Vec::new();
            for mi in self.snap.available.iter() {
                crate::resilver::collect_paths(&mi.path, &mut all);
            }
            all
        };

        for path in paths {
            if self.base.aborted() {
                break;
            }
            let Ok(parsed) = ParsedFqn::parse(&self.snap, &path) else {
                continue;
            };
            if parsed.ct != ContentType::Obj {
                continue;
            }
            if let Err(err) = self.rebalance_object(&parsed).await {
                if err.is_oos() {
                    self.base.add_err(&err);
                    self.base.abort("out of space");
                    break;
                }
                self.base.add_err(format!("{}: {err}", path.display()));
            }
        }

        self.base.dec_pending();
        if let Some(recv) = &self.recv {
            recv.unregister(TRNAME, &self.base.id().to_string());
        }
        if !self.base.aborted() {
            volume::remove_marker(&self.snap, Marker::Rebalance);
            self.base.finish();
        }
    }

    async fn rebalance_object(&self, parsed: &ParsedFqn) -> Result<(), MoveError> {
        let uname = parsed.bck.make_uname(&parsed.objname);
        let owner = match hrw::target(&uname, &self.smap) {
            Ok(owner) => owner,
            // No active targets: nothing sane to do.
            Err(_) => return Ok(()),
        };
        if owner.id == self.self_id {
            return Ok(());
        }
        let Some(bundle) = &self.bundle else {
            // No streams configured (single-node): leave in place.
            return Ok(());
        };

        let mut lom = Lom::init_at(parsed.bck.clone(), &parsed.objname, parsed.mi.clone());
        lom.load()?;
        let body = std::fs::read(&lom.fqn)?;
        let hdr = transport::ObjHdr {
            bck: parsed.bck.clone(),
            objname: parsed.objname.clone(),
            size: lom.md.size,
            atime_ns: lom.md.atime_ns,
            cksum_type: lom.md.cksum_type.as_str().to_string(),
            cksum_value: lom.md.cksum_value.clone(),
            opaque: Vec::new(),
        };
        bundle.send(owner, hdr, bytes::Bytes::from(body)).await?;
        volume::trash(&parsed.mi, &lom.fqn)?;
        self.base.add_obj(lom.md.size);
        Ok(())
    }
}

pub struct RebalanceFactory {
    pub self_id: String,
    pub mpi: Arc<volume::Mpi>,
    pub smap: Arc<dyn Fn() -> Arc<Smap> + Send + Sync>,
    pub client: Option<reqwest::Client>,
    pub recv: Option<Arc<transport::RecvRegistry>>,
    pub netw_timeout: std::time::Duration,
}

impl xaction::Factory for RebalanceFactory {
    fn kind(&self) -> XactKind {
        XactKind::Rebalance
    }

    fn start(&self, _args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
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
        let xact = XactRebalance::new(
            id,
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

#[cfg(test)]
mod tests {
    use super::*;
    use models::{Bck, NodeRole, Snode};

    #[tokio::test]
    async fn owned_objects_stay_put() {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let bck = Bck::ais("b");
        for i in 0..6 {
            let mut lom = Lom::init(bck.clone(), &format!("o-{i}"), &snap).unwrap();
            std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
            std::fs::write(&lom.fqn, b"stay").unwrap();
            lom.persist_now().unwrap();
        }

        // Single-target cluster: this target owns everything.
        let url: url::Url = "http://127.0.0.1:8080".parse().unwrap();
        let mut smap = Smap::new("u", Snode::new("p1", NodeRole::Proxy, url.clone()));
        smap.put_node(Snode::new("t1", NodeRole::Target, url));

        let xact = XactRebalance::new(
            models::IdGenerator::new(18).next(),
            snap.clone(),
            Arc::new(smap),
            "t1".to_string(),
            None,
            None,
        );
        xact.clone().run().await;
        assert!(xact.base().finished());
        assert_eq!(xact.snap().stats.objs, 0);
        assert!(!volume::marker_exists(&snap, Marker::Rebalance));

        for i in 0..6 {
            let mut lom = Lom::init(bck.clone(), &format!("o-{i}"), &snap).unwrap();
            lom.load().unwrap();
        }
    }
}
